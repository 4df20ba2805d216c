//! Text output hook.
//!
//! The board has no UART; whoever embeds the machine registers a sink once
//! at power-on and everything the kernel prints goes through it. Output is
//! dropped silently until a sink is set.

use spin::Once;

static SINK: Once<fn(&str)> = Once::new();

/// Register the console sink. Later calls are ignored.
pub fn set_output(sink: fn(&str)) {
    SINK.call_once(|| sink);
}

/// Write a string to the console, if one is attached.
pub fn putstr(s: &str) {
    if let Some(sink) = SINK.get() {
        sink(s);
    }
}
