//! Device locking and blocking discipline
//!
//! Two levels: a reentrant *raw lock* for plain mutual exclusion, and
//! a *blocked state* a device enters while e.g. waiting for an
//! operator. A blocked device is raw-unlocked (the waiter sleeps on a
//! condition variable), but `rlock` callers honor the blocked state
//! and queue up behind it. A small allowlist of safe operations
//! (label read/write) may instead *steal* past a blocked device via
//! [`BlockingLock::try_begin_safe_op`]; the guard restores the prior
//! blocked state, so there is exactly one restorer per stealer.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    NotBlocked,
    /// Operator unmounted the media
    Unmounted,
    /// Waiting for the operator to mount media
    WaitingForSysop,
    /// Device is being acquired by a job
    DoingAcquire,
    /// A label is being written
    WritingLabel,
    /// Unmounted and a mount request is outstanding
    UnmountedWaitingForSysop,
    /// Operator signaled mount-ready
    Mount,
    /// Spool data is being written out
    Despooling,
    /// Device is being released
    Releasing,
}

impl BlockedReason {
    pub fn is_blocked(&self) -> bool {
        *self != BlockedReason::NotBlocked
    }

    /// States a safe operation may steal past: the blocked thread is
    /// parked on a condition variable and cannot touch the device.
    fn stealable(&self) -> bool {
        matches!(
            self,
            BlockedReason::Unmounted
                | BlockedReason::WaitingForSysop
                | BlockedReason::UnmountedWaitingForSysop
                | BlockedReason::Mount
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedReason::NotBlocked => "not blocked",
            BlockedReason::Unmounted => "user unmounted device",
            BlockedReason::WaitingForSysop => "waiting for operator",
            BlockedReason::DoingAcquire => "opening, validating or positioning",
            BlockedReason::WritingLabel => "writing label",
            BlockedReason::UnmountedWaitingForSysop => "unmounted, waiting for operator",
            BlockedReason::Mount => "mount request",
            BlockedReason::Despooling => "despooling",
            BlockedReason::Releasing => "releasing device",
        }
    }
}

struct LockCore {
    holder: Option<ThreadId>,
    count: u32,
    blocked: BlockedReason,
    /// thread that entered the blocked state; it may still pass
    /// `rlock` to run the operation it blocked the device for
    blocker: Option<ThreadId>,
    /// a safe op is in flight, its guard will restore `saved`
    stolen: bool,
    saved: BlockedReason,
    /// a new volume became available
    mount_signal: bool,
}

pub struct BlockingLock {
    core: Mutex<LockCore>,
    wait: Condvar,
    wait_next_vol: Condvar,
}

impl Default for BlockingLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingLock {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(LockCore {
                holder: None,
                count: 0,
                blocked: BlockedReason::NotBlocked,
                blocker: None,
                stolen: false,
                saved: BlockedReason::NotBlocked,
                mount_signal: false,
            }),
            wait: Condvar::new(),
            wait_next_vol: Condvar::new(),
        }
    }

    /// Raw reentrant lock, ignores the blocked state.
    pub fn lock(&self) -> LockGuard<'_> {
        let me = thread::current().id();
        let mut core = self.core.lock().unwrap();
        loop {
            match core.holder {
                None => {
                    core.holder = Some(me);
                    core.count = 1;
                    break;
                }
                Some(holder) if holder == me => {
                    core.count += 1;
                    break;
                }
                Some(_) => core = self.wait.wait(core).unwrap(),
            }
        }
        LockGuard { lock: self }
    }

    /// Like [`lock`](Self::lock), but also honors the blocked state:
    /// callers queue up while the device is blocked for some reason.
    /// The thread that blocked the device passes through, otherwise it
    /// could never finish the operation it blocked the device for.
    pub fn rlock(&self) -> LockGuard<'_> {
        let me = thread::current().id();
        let mut core = self.core.lock().unwrap();
        loop {
            match core.holder {
                Some(holder) if holder == me => {
                    core.count += 1;
                    break;
                }
                None if !core.blocked.is_blocked() || core.blocker == Some(me) => {
                    core.holder = Some(me);
                    core.count = 1;
                    break;
                }
                _ => core = self.wait.wait(core).unwrap(),
            }
        }
        LockGuard { lock: self }
    }

    fn unlock(&self) {
        let mut core = self.core.lock().unwrap();
        debug_assert_eq!(core.holder, Some(thread::current().id()));
        core.count -= 1;
        if core.count == 0 {
            core.holder = None;
            self.wait.notify_all();
        }
    }

    /// Enter a blocked state. The caller must hold the raw lock and
    /// is expected to drop it afterwards so others can queue/steal.
    pub fn block(&self, _guard: &LockGuard<'_>, reason: BlockedReason) {
        let mut core = self.core.lock().unwrap();
        core.blocked = reason;
        core.blocker = Some(thread::current().id());
    }

    /// Leave the blocked state, waking every queued thread.
    pub fn unblock(&self) {
        let mut core = self.core.lock().unwrap();
        core.blocked = BlockedReason::NotBlocked;
        core.blocker = None;
        self.wait.notify_all();
        self.wait_next_vol.notify_all();
    }

    pub fn blocked(&self) -> BlockedReason {
        self.core.lock().unwrap().blocked
    }

    /// Begin a safe operation past a blocked device.
    ///
    /// Succeeds only if nobody holds the raw lock, the device is in a
    /// stealable blocked state and no other safe operation is in
    /// flight. The returned guard restores the prior blocked state on
    /// drop.
    pub fn try_begin_safe_op(&self, reason: BlockedReason) -> Option<SafeOpGuard<'_>> {
        let me = thread::current().id();
        let mut core = self.core.lock().unwrap();
        if core.holder.is_some() || core.stolen || !core.blocked.stealable() {
            return None;
        }
        core.saved = core.blocked;
        core.blocked = reason;
        core.stolen = true;
        core.holder = Some(me);
        core.count = 1;
        Some(SafeOpGuard { lock: self })
    }

    /// Signal that a new volume became available/mounted.
    pub fn signal_next_volume(&self) {
        let mut core = self.core.lock().unwrap();
        core.mount_signal = true;
        self.wait_next_vol.notify_all();
    }

    /// Wait (bounded) for a next-volume signal. Returns true if the
    /// signal arrived, false on timeout or spurious wake.
    pub fn wait_next_volume(&self, timeout: Duration) -> bool {
        let core = self.core.lock().unwrap();
        if core.mount_signal {
            let mut core = core;
            core.mount_signal = false;
            return true;
        }
        let (mut core, _result) = self.wait_next_vol.wait_timeout(core, timeout).unwrap();
        if core.mount_signal {
            core.mount_signal = false;
            true
        } else {
            false
        }
    }
}

/// Raw lock guard, releases on drop.
pub struct LockGuard<'a> {
    lock: &'a BlockingLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Safe-operation guard: holds the raw lock and restores the stolen
/// blocked state on drop.
pub struct SafeOpGuard<'a> {
    lock: &'a BlockingLock,
}

impl Drop for SafeOpGuard<'_> {
    fn drop(&mut self) {
        let mut core = self.lock.core.lock().unwrap();
        debug_assert!(core.stolen);
        core.blocked = core.saved;
        core.saved = BlockedReason::NotBlocked;
        core.stolen = false;
        core.count = 0;
        core.holder = None;
        self.lock.wait.notify_all();
    }
}
