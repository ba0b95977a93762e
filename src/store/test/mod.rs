//! End-to-end scenarios across the store modules

mod mount_flow;

use std::sync::Arc;

use crate::store::catalog::{LogMessenger, MemoryCatalog};
use crate::store::StoreContext;

pub(crate) fn test_dir(module: &str, name: &str) -> String {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = format!("./target/testout/{}/{}", module.replace("::", "/"), name);
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

pub(crate) fn memory_store() -> (StoreContext, Arc<MemoryCatalog>) {
    let catalog = Arc::new(MemoryCatalog::new());
    let store = StoreContext::new(catalog.clone(), Arc::new(LogMessenger));
    (store, catalog)
}
