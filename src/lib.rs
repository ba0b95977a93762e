//! Magnetar Backup storage daemon core
//!
//! This library implements the device/volume I/O subsystem of the
//! storage daemon: the device abstraction with its locking and
//! blocking discipline, volume reservation and autochanger
//! coordination, and the volume/session label lifecycle. The on-media
//! block/record format lives in the `mag-tape` crate.

pub mod store;
pub mod tools;
