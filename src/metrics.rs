use std::sync::atomic::{AtomicUsize, Ordering};

pub static JOBS_QUEUED: AtomicUsize = AtomicUsize::new(0);
pub static DISPATCH_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
pub static DISPATCH_RETRIES: AtomicUsize = AtomicUsize::new(0);
pub static JOBS_COMPLETED: AtomicUsize = AtomicUsize::new(0);
pub static JOBS_FAILED: AtomicUsize = AtomicUsize::new(0);
pub static WEBHOOKS_RECEIVED: AtomicUsize = AtomicUsize::new(0);

pub fn inc_queued() { JOBS_QUEUED.fetch_add(1, Ordering::Relaxed); }
pub fn set_queued(value: usize) { JOBS_QUEUED.store(value, Ordering::Relaxed); }
pub fn dec_queued() {
    let _ = JOBS_QUEUED.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

pub fn inc_in_flight() { DISPATCH_IN_FLIGHT.fetch_add(1, Ordering::Relaxed); }
pub fn dec_in_flight() {
    let _ = DISPATCH_IN_FLIGHT.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

pub fn inc_retries() { DISPATCH_RETRIES.fetch_add(1, Ordering::Relaxed); }
pub fn inc_completed() { JOBS_COMPLETED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_failed() { JOBS_FAILED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_webhooks() { WEBHOOKS_RECEIVED.fetch_add(1, Ordering::Relaxed); }

pub fn get_metrics() -> String {
    let queued = JOBS_QUEUED.load(Ordering::Relaxed);
    let in_flight = DISPATCH_IN_FLIGHT.load(Ordering::Relaxed);
    let retries = DISPATCH_RETRIES.load(Ordering::Relaxed);
    let completed = JOBS_COMPLETED.load(Ordering::Relaxed);
    let failed = JOBS_FAILED.load(Ordering::Relaxed);
    let webhooks = WEBHOOKS_RECEIVED.load(Ordering::Relaxed);

    format!(
        "# HELP pitchside_jobs_queued Jobs waiting in the dispatch queue\n\
         # TYPE pitchside_jobs_queued gauge\n\
         pitchside_jobs_queued {}\n\
         # HELP pitchside_dispatch_in_flight Dispatch requests currently being submitted\n\
         # TYPE pitchside_dispatch_in_flight gauge\n\
         pitchside_dispatch_in_flight {}\n\
         # HELP pitchside_dispatch_retries_total Dispatch attempts scheduled for retry\n\
         # TYPE pitchside_dispatch_retries_total counter\n\
         pitchside_dispatch_retries_total {}\n\
         # HELP pitchside_jobs_completed_total Jobs that reached COMPLETED\n\
         # TYPE pitchside_jobs_completed_total counter\n\
         pitchside_jobs_completed_total {}\n\
         # HELP pitchside_jobs_failed_total Jobs that reached FAILED\n\
         # TYPE pitchside_jobs_failed_total counter\n\
         pitchside_jobs_failed_total {}\n\
         # HELP pitchside_webhooks_received_total Accepted vision service callbacks\n\
         # TYPE pitchside_webhooks_received_total counter\n\
         pitchside_webhooks_received_total {}\n",
        queued, in_flight, retries, completed, failed, webhooks
    )
}
