use std::time::Duration;

use serial_test::serial;

// All four scenarios touch the process-wide runtime singleton (small id
// allocation, the reusable pool, the current thread's signal state), so
// they run serialized rather than racing each other the way independent
// unit tests normally would.

#[test]
#[serial]
fn block_race_never_blocks_when_unblock_wins() {
    let report = threadrt_harness::block_race().unwrap();
    assert!(report.returned_immediately);
}

#[test]
#[serial]
fn signal_while_blocked_dispatches_handler_exactly_once() {
    let report = threadrt_harness::signal_while_blocked().unwrap();
    assert_eq!(report.handler_invocations, 1);
    assert!(report.dispatched_while_blocked);
}

#[test]
#[serial]
fn detached_reclaim_recovers_all_ids_within_budget() {
    let report = threadrt_harness::detached_reclaim(64, Duration::from_secs(2)).unwrap();
    assert_eq!(report.spawned, 64);
    assert!(!report.timed_out, "reclamation should finish inside the budget");
    assert_eq!(report.reclaimed_within_budget, 64);
}

#[test]
#[serial]
fn cancel_with_cleanup_runs_handler_before_exit() {
    let report = threadrt_harness::cancel_with_cleanup().unwrap();
    assert!(report.cleanup_ran);
}
