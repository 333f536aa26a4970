/// Split a message into chunks of at most `max_chars` characters.
///
/// Splits on newline boundaries when possible, falling back to hard splits
/// when a single line is longer than the limit. Never splits inside a
/// character.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };

        if needed <= max_chars {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len = needed;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            let mut pieces = chars.chunks(max_chars).peekable();
            while let Some(piece) = pieces.next() {
                let piece: String = piece.iter().collect();
                if pieces.peek().is_some() {
                    chunks.push(piece);
                } else {
                    current_len = piece.chars().count();
                    current = piece;
                }
            }
        } else {
            current = line.to_string();
            current_len = line_len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_unchanged() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
        assert_eq!(split_message("", 100), vec![""]);
    }

    #[test]
    fn splits_on_newlines() {
        assert_eq!(
            split_message("line1\nline2\nline3", 11),
            vec!["line1\nline2", "line3"]
        );
    }

    #[test]
    fn hard_splits_long_lines() {
        assert_eq!(split_message("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn respects_char_boundaries() {
        let text = "ééééé";
        let chunks = split_message(text, 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn chunks_never_exceed_limit() {
        let text = format!("{}\n{}\nshort", "x".repeat(50), "y".repeat(9));
        for chunk in split_message(&text, 10) {
            assert!(chunk.chars().count() <= 10, "{chunk:?}");
        }
    }
}
