const MAX_LINE_CHARS: usize = 4096;

enum Escape {
    Start,
    Csi,
    Osc,
}

/// Strip terminal escape sequences and control characters from one line of
/// captured subprocess output so the run log stays printable and parseable.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut count = 0usize;
    let mut truncated = false;

    for c in input.chars() {
        if let Some(mode) = escape.as_ref() {
            match mode {
                Escape::Start => match c {
                    '[' => escape = Some(Escape::Csi),
                    ']' => escape = Some(Escape::Osc),
                    _ => escape = None,
                },
                Escape::Csi => {
                    if ('@'..='~').contains(&c) {
                        escape = None;
                    }
                }
                Escape::Osc => {
                    if c == '\x07' || c == '\x1b' {
                        escape = None;
                    }
                }
            }
            continue;
        }

        match c {
            '\x1b' => escape = Some(Escape::Start),
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }

        if count >= MAX_LINE_CHARS {
            truncated = true;
            break;
        }
    }

    if truncated {
        out.push_str(" ...[truncated]");
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::sanitize_line;

    #[test]
    fn strips_color_and_title_sequences() {
        let input = "get \u{1b}[32mok\u{1b}[0m \u{1b}]0;title\u{7} done";
        assert_eq!(sanitize_line(input), "get ok  done");
    }

    #[test]
    fn strips_newlines_tabs_and_bidi_controls() {
        let input = "a\tb\nc\r\u{202e}x";
        assert_eq!(sanitize_line(input), "a bcx");
    }
}
