//! Lifecycle events under the `tracing` feature. Run with:
//!
//! ```text
//! cargo test --features tracing --test tracing
//! ```

#![cfg(all(feature = "tracing", not(loom)))]

use packrc::Shared;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Metadata, Subscriber};

/// Keeps the message of every event, in order.
#[derive(Clone, Default)]
struct Recorder {
    messages: Arc<Mutex<Vec<String>>>,
}

struct Message(Option<String>);

impl Visit for Message {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{:?}", value));
        }
    }
}

impl Subscriber for Recorder {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _: &Id, _: &Record<'_>) {}

    fn record_follows_from(&self, _: &Id, _: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut message = Message(None);
        event.record(&mut message);
        if let Some(m) = message.0 {
            self.messages.lock().unwrap().push(m);
        }
    }

    fn enter(&self, _: &Id) {}

    fn exit(&self, _: &Id) {}
}

fn recorded(f: impl FnOnce()) -> Vec<String> {
    let recorder = Recorder::default();
    tracing::subscriber::with_default(recorder.clone(), f);
    let messages = recorder.messages.lock().unwrap().clone();
    messages
}

#[test]
fn test_lifecycle_events() {
    let messages = recorded(|| {
        let a = Shared::new(String::from("x"));
        let w = Shared::downgrade(&a);
        drop(a);
        assert!(w.upgrade().is_none());
        drop(w);
    });
    assert_eq!(
        messages,
        [
            "value destroyed",
            "promotion refused, value is gone",
            "allocation freed",
        ]
    );
}

#[test]
fn test_construction_failure_event() {
    let messages = recorded(|| {
        let r = Shared::<u8>::try_new_with(|| Err("bad"));
        assert!(r.is_err());
    });
    assert_eq!(messages, ["value construction failed"]);
}

#[test]
fn test_last_strong_frees_without_weak() {
    let messages = recorded(|| drop(Shared::new(1u64)));
    assert_eq!(messages, ["value destroyed", "allocation freed"]);
}
