//! Fuzz target for Request::decode
//!
//! Feeds arbitrary text frames to the request decoder to find:
//! - Parser crashes or panics
//! - Discriminants that slip past the known request types
//! - Validation that panics instead of returning an error
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use seed_proto::{Message, Request};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    let Ok(request) = Request::decode(&text) else {
        return;
    };

    // Anything that decodes must re-encode, and validation must not panic
    assert!(request.encode().is_ok(), "decoded request failed to encode");

    match request {
        Request::Send(send) => {
            let _ = Message::try_from(send.message);
        },
        Request::Subscribe(subscribe) => {
            let _ = subscribe.stream_key();
        },
        Request::Unsubscribe(unsubscribe) => {
            let _ = unsubscribe.stream_key();
        },
        Request::History(history) => {
            let _ = history.stream_key();
        },
        Request::Ping => {},
    }
});
