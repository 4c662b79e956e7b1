//! Terminal-safe rendering of strings taken from dashboards and patches.
//!
//! Titles, expressions and override values are user data; they are printed to a terminal by
//! `panels` and `--dry-run`, so escape sequences and bidi controls are dropped first.

use serde_json::Value;

#[derive(Clone, Copy)]
enum Escape {
    /// Saw ESC, waiting for the introducer.
    Start,
    /// CSI: ends at a final byte in `@..=~`.
    Csi,
    /// OSC: ends at BEL or ESC `\`.
    Osc { saw_esc: bool },
    /// DCS/SOS/PM/APC: end at ESC `\`.
    String { saw_esc: bool },
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Strip terminal escapes and control characters, collapse line breaks and tabs to spaces,
/// and clip to `max_chars` (with a trailing `…`).
pub fn sanitize(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars + 1));
    let mut state: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(esc) = state {
            state = match (esc, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::Osc { saw_esc: false }),
                (Escape::Start, 'P' | 'X' | '^' | '_') => Some(Escape::String { saw_esc: false }),
                (Escape::Start, _) => None,
                (Escape::Csi, c) if ('@'..='~').contains(&c) => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Osc { .. }, '\x07') => None,
                (Escape::Osc { saw_esc: true }, '\\') => None,
                (Escape::Osc { .. }, c) => Some(Escape::Osc {
                    saw_esc: c == '\x1b',
                }),
                (Escape::String { saw_esc: true }, '\\') => None,
                (Escape::String { .. }, c) => Some(Escape::String {
                    saw_esc: c == '\x1b',
                }),
            };
            continue;
        }

        let emitted = match c {
            '\x1b' => {
                state = Some(Escape::Start);
                continue;
            }
            '\t' | '\n' | '\r' => ' ',
            c if c.is_control() || is_bidi_control(c) => continue,
            c => c,
        };

        if count == max_chars {
            out.push('…');
            break;
        }
        out.push(emitted);
        count += 1;
    }
    out
}

/// Compact JSON rendering of a value for one-line output.
pub fn clip_value(value: &Value, max_chars: usize) -> String {
    sanitize(&value.to_string(), max_chars)
}
