// =============================================================================
// ARNm Runtime — C ABI Session Test
// =============================================================================
//
// Drives a full runtime session the way a compiled ARNm program would:
// through the exported arnm_* symbols and the installed global instance.
// This file holds a single test because the ABI slot is one-per-program;
// the harness gives each integration-test file its own process.
// =============================================================================

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arnm_runtime::abi::*;

const TAG_WORK: u64 = 10;
const TAG_STOP: u64 = 11;

static WORK_SEEN: AtomicUsize = AtomicUsize::new(0);
static SELF_PIDS_OK: AtomicUsize = AtomicUsize::new(0);
static RECEIVER_PID: AtomicU64 = AtomicU64::new(0);
static AFTER_EXIT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn receiver_entry(_arg: *mut c_void) {
    // arnm_self agrees with the handle the spawner got.
    let me = arnm_self();
    if arnm_pid(me) == RECEIVER_PID.load(Ordering::SeqCst) {
        SELF_PIDS_OK.fetch_add(1, Ordering::SeqCst);
    }
    // State buffer: spawned with 32 bytes, must be zeroed and writable.
    let state = arnm_state() as *mut u64;
    assert!(!state.is_null());
    unsafe {
        assert_eq!(state.read(), 0);
        state.write(7);
    }

    loop {
        let msg = arnm_receive();
        let tag = arnm_message_tag(msg);
        match tag {
            TAG_WORK => {
                // Payload is 8 copied bytes carrying the iteration index.
                assert_eq!(arnm_message_size(msg), 8);
                let data = arnm_message_data(msg) as *const u8;
                let bytes = unsafe { std::slice::from_raw_parts(data, 8) };
                let value = u64::from_le_bytes(bytes.try_into().unwrap());
                WORK_SEEN.fetch_add(1, Ordering::SeqCst);
                assert!(value < 5);
                arnm_message_free(msg);
            }
            TAG_STOP => {
                arnm_message_free(msg);
                break;
            }
            other => panic!("unexpected tag {other}"),
        }
    }
}

extern "C" fn sender_entry(arg: *mut c_void) {
    let receiver = arg; // the receiver's handle rides in the argument
    for i in 0..5u64 {
        let payload = i.to_le_bytes();
        let rc = arnm_send(
            receiver,
            TAG_WORK,
            payload.as_ptr() as *const c_void,
            payload.len(),
        );
        assert_eq!(rc, 0);
        arnm_yield();
    }
    assert_eq!(arnm_send(receiver, TAG_STOP, ptr::null(), 0), 0);
}

extern "C" fn exiting_entry(_arg: *mut c_void) {
    arnm_exit();
    // Unreachable: arnm_exit never returns.
    #[allow(unreachable_code)]
    {
        AFTER_EXIT.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn full_session_through_the_c_abi() {
    assert_eq!(arnm_init(2), 0);
    assert_eq!(arnm_init(2), -1, "double init must fail");

    // Outside any process: no self, nothing to receive.
    assert!(arnm_self().is_null());
    assert!(arnm_try_receive().is_null());
    assert!(arnm_state().is_null());

    let receiver = arnm_spawn(Some(receiver_entry), ptr::null_mut(), 32);
    assert!(!receiver.is_null());
    RECEIVER_PID.store(arnm_pid(receiver), Ordering::SeqCst);
    assert!(arnm_pid(receiver) >= 1);

    let sender = arnm_spawn(Some(sender_entry), receiver, 0);
    assert!(!sender.is_null());
    assert_ne!(arnm_pid(sender), arnm_pid(receiver));

    let quitter = arnm_spawn(Some(exiting_entry), ptr::null_mut(), 0);
    assert!(!quitter.is_null());

    arnm_run();

    assert_eq!(WORK_SEEN.load(Ordering::SeqCst), 5);
    assert_eq!(SELF_PIDS_OK.load(Ordering::SeqCst), 1);
    assert_eq!(AFTER_EXIT.load(Ordering::SeqCst), 0, "arnm_exit must not return");

    arnm_shutdown();

    // The slot is free again: a fresh session can start.
    assert_eq!(arnm_init(1), 0);
    arnm_shutdown();

    // Spawning with no runtime installed fails cleanly.
    assert!(arnm_spawn(Some(receiver_entry), ptr::null_mut(), 0).is_null());
}
