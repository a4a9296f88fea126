/// Structured warning for a single item that did not complete cleanly.
#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    /// Stable `ShiftError` code of the underlying cause.
    pub error_code: &'a str,
    pub stage: &'a str,
    pub signature: &'a str,
    pub folder: &'a str,
    pub attempt: u32,
    pub retry: &'a str,
    pub err: &'a str,
}

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn emit(event: WarnEvent<'_>) {
    tracing::warn!(
        code = %sanitize_value(event.code),
        error_code = %sanitize_value(event.error_code),
        stage = %sanitize_value(event.stage),
        signature = %sanitize_value(event.signature),
        folder = %sanitize_value(event.folder),
        attempt = event.attempt,
        retry = %sanitize_value(event.retry),
        err = %sanitize_value(event.err),
        "item did not complete"
    );
}

#[cfg(test)]
mod tests {
    use super::sanitize_value;

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
    }

    #[test]
    fn sanitize_value_falls_back_for_empty() {
        assert_eq!(sanitize_value("   "), "na");
    }

    #[test]
    fn sanitize_value_drops_non_ascii() {
        assert_eq!(sanitize_value("INBOX/Ärchiv"), "INBOX/rchiv");
    }
}
