use std::sync::atomic::{AtomicU8, Ordering};

/// Fits `input` into a NUL-bounded field of `width` bytes.
///
/// At most `width - 1` bytes are kept and the cut never splits a UTF-8
/// sequence. Returns the kept prefix and whether anything was dropped.
pub fn truncate_to_field(input: &str, width: usize) -> (&str, bool) {
    let limit = width.saturating_sub(1);
    // Interior NULs would end the field early on the reader side.
    let input = match input.find('\0') {
        Some(pos) => &input[..pos],
        None => input,
    };
    if input.len() <= limit {
        return (input, false);
    }
    let mut end = limit;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    (&input[..end], true)
}

/// Writes `text` into a shared field, zero-filling the tail.
pub fn store_field(field: &[AtomicU8], text: &str) -> bool {
    let (kept, truncated) = truncate_to_field(text, field.len());
    let bytes = kept.as_bytes();
    for (index, slot) in field.iter().enumerate() {
        let byte = bytes.get(index).copied().unwrap_or(0);
        slot.store(byte, Ordering::Relaxed);
    }
    truncated
}

pub fn load_field(field: &[AtomicU8]) -> String {
    let mut bytes = Vec::with_capacity(field.len());
    for slot in field {
        let byte = slot.load(Ordering::Relaxed);
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
