//! Waiting for the operator
//!
//! When a job needs a volume nobody can provide automatically, the
//! device enters the blocked state and the job parks here. The
//! operator is re-notified with a doubling interval, starting at
//! `vol_poll_wait` and capped at `max_vol_wait`. Mount notifications
//! arrive through [`Device::signal_next_volume`]; cancellation is
//! polled about once a second.

use std::time::{Duration, Instant};

use anyhow::Error;

use crate::store::dcr::DeviceContext;
use crate::store::lock::BlockedReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// A volume was mounted/made available
    VolumeMounted,
    /// The overall budget ran out
    Timeout,
    /// The job was cancelled while waiting
    Cancelled,
}

/// Block the device and wait for the operator to provide a volume.
///
/// `budget` bounds the total wait. A prior blocked state (the mount
/// loop blocks the device for the whole acquire) is restored before
/// returning, otherwise the device is unblocked.
pub fn wait_for_sysop(
    dcr: &mut DeviceContext,
    budget: Duration,
    reason: &str,
) -> Result<WaitStatus, Error> {
    let dev = dcr.dev.clone();

    let prior = dev.blocked();
    {
        let guard = dev.rlock();
        dev.block(&guard, BlockedReason::WaitingForSysop);
    }

    let deadline = Instant::now() + budget;
    let mut interval = Duration::from_secs(dev.config.vol_poll_wait.max(1));
    let max_interval = Duration::from_secs(dev.config.max_vol_wait.max(1));

    let status = 'outer: loop {
        if dcr.vol_name.is_empty() {
            dcr.messenger
                .request_create(dev.name(), &dev.config.media_type, reason);
        } else {
            dcr.messenger
                .request_mount(dev.name(), &dcr.vol_name, reason);
        }

        let mut slept = Duration::ZERO;
        while slept < interval {
            if dcr.is_cancelled() {
                break 'outer WaitStatus::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                break 'outer WaitStatus::Timeout;
            }
            let slice = (interval - slept)
                .min(Duration::from_secs(1))
                .min(deadline - now);
            if dev.wait_next_volume(slice) {
                break 'outer WaitStatus::VolumeMounted;
            }
            slept += slice;
        }

        interval = (interval * 2).min(max_interval);
    };

    if prior.is_blocked() {
        let guard = dev.rlock();
        dev.block(&guard, prior);
    } else {
        dev.unblock();
    }
    log::debug!(
        "device {}: operator wait finished ({:?})",
        dev.name(),
        status
    );
    Ok(status)
}

/// Wait for any volume in the fleet to be released.
///
/// Used when every candidate device is busy: instead of hammering the
/// reservation table, the job sleeps until a release bumps it.
/// Cancellation is polled about once a second. Returns true when a
/// release happened within the budget.
pub fn wait_for_device(dcr: &DeviceContext, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if dcr.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let slice = (deadline - now).min(Duration::from_secs(1));
        if dcr.volumes.wait_released(slice) {
            return true;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use crate::store::catalog::{LogMessenger, MemoryCatalog};
    use crate::store::device::Device;
    use crate::store::reserve::VolumeReservations;
    use crate::store::{DeviceConfig, DeviceType};

    fn make_context(name: &str) -> DeviceContext {
        let mut config = DeviceConfig::new(
            "vt0",
            &format!("./target/testout/waittest/{name}"),
            DeviceType::VTape,
            "VTape",
        );
        config.vol_poll_wait = 1;
        config.max_vol_wait = 4;
        let dev = Arc::new(Device::new(config));
        DeviceContext::new(
            dev,
            Arc::new(MemoryCatalog::new()),
            Arc::new(LogMessenger),
            Arc::new(VolumeReservations::new()),
            Arc::new(crate::store::changer::ChangerRegistry::new()),
            1,
            1,
            1700000000,
        )
    }

    #[test]
    fn mount_signal_ends_the_wait() -> Result<(), Error> {
        let mut dcr = make_context("mount_signal_ends_the_wait");
        let dev = dcr.dev.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            dev.signal_next_volume();
        });

        let status = wait_for_sysop(&mut dcr, Duration::from_secs(30), "test")?;
        assert_eq!(status, WaitStatus::VolumeMounted);
        assert!(!dcr.dev.blocked().is_blocked());
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn budget_runs_out() -> Result<(), Error> {
        let mut dcr = make_context("budget_runs_out");
        let start = Instant::now();
        let status = wait_for_sysop(&mut dcr, Duration::from_millis(150), "test")?;
        assert_eq!(status, WaitStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!dcr.dev.blocked().is_blocked());
        Ok(())
    }

    #[test]
    fn prior_blocked_state_survives_the_wait() -> Result<(), Error> {
        let mut dcr = make_context("prior_blocked_state_survives_the_wait");
        let dev = dcr.dev.clone();
        {
            let guard = dev.rlock();
            dev.block(&guard, BlockedReason::DoingAcquire);
        }

        // called from the thread that holds the acquire block; must
        // return instead of queueing behind its own blocked state
        let status = wait_for_sysop(&mut dcr, Duration::from_millis(150), "test")?;
        assert_eq!(status, WaitStatus::Timeout);
        assert_eq!(dev.blocked(), BlockedReason::DoingAcquire);

        dev.unblock();
        Ok(())
    }

    #[test]
    fn released_volume_wakes_device_waiters() -> Result<(), Error> {
        let dcr = make_context("released_volume_wakes_device_waiters");
        dcr.volumes.reserve_volume("Vol0001", "other-drive")?;

        let volumes = dcr.volumes.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            volumes.free_volume("Vol0001");
        });

        assert!(wait_for_device(&dcr, Duration::from_secs(30)));
        handle.join().unwrap();

        // nothing released: the budget runs out
        assert!(!wait_for_device(&dcr, Duration::from_millis(100)));
        Ok(())
    }

    #[test]
    fn cancellation_is_noticed() -> Result<(), Error> {
        let mut dcr = make_context("cancellation_is_noticed");
        let cancel = dcr.cancel_flag();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.store(true, Ordering::Relaxed);
        });

        let status = wait_for_sysop(&mut dcr, Duration::from_secs(30), "test")?;
        assert_eq!(status, WaitStatus::Cancelled);
        handle.join().unwrap();
        Ok(())
    }
}
