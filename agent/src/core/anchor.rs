//! Literal-anchor edits: insert before/after or replace at an anchor whose
//! occurrence count must match what the plan declared.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorEdit<'a> {
    InsertAfter(&'a str),
    InsertBefore(&'a str),
    ReplaceOnce(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorMismatch {
    pub found: usize,
    pub expected: usize,
}

/// Non-overlapping occurrences of `anchor` in `text`.
pub fn count_occurrences(text: &str, anchor: &str) -> usize {
    if anchor.is_empty() {
        return 0;
    }
    text.matches(anchor).count()
}

/// Apply `edit` at the first occurrence of `anchor`, provided the anchor occurs
/// exactly `expected` times.
pub fn apply_anchor_edit(
    text: &str,
    anchor: &str,
    expected: usize,
    edit: AnchorEdit<'_>,
) -> Result<String, AnchorMismatch> {
    let found = count_occurrences(text, anchor);
    let position = match text.find(anchor) {
        Some(pos) if found == expected && !anchor.is_empty() => pos,
        _ => return Err(AnchorMismatch { found, expected }),
    };
    let end = position + anchor.len();

    let mut out = String::with_capacity(text.len() + anchor.len());
    match edit {
        AnchorEdit::InsertAfter(content) => {
            out.push_str(&text[..end]);
            out.push_str(content);
            out.push_str(&text[end..]);
        }
        AnchorEdit::InsertBefore(content) => {
            out.push_str(&text[..position]);
            out.push_str(content);
            out.push_str(&text[position..]);
        }
        AnchorEdit::ReplaceOnce(replacement) => {
            out.push_str(&text[..position]);
            out.push_str(replacement);
            out.push_str(&text[end..]);
        }
    }
    Ok(out)
}
