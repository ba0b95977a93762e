pub mod vec {
    pub fn undefined(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }
}
