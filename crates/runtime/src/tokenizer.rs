//! Whitespace-splitting tokenizer.
//!
//! `tokens` is the consumer-facing surface of the unicode codec: split
//! input at Unicode whitespace runs, decode any escape sequence inside
//! each token, and return the tokens as a persistent list of String
//! values (in order). Turning tokens into an AST is an evaluator
//! concern outside this crate.

use bowl_core::heap::{Heap, LibraryReaper};
use bowl_core::unicode;
use bowl_core::value::Handle;
use bowl_core::{list, sentinel::Sentinels};

use crate::error;

/// Splits `text` into a persistent list of String values, top item
/// first read, but reconstructed in input order.
pub fn tokens(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    sentinels: &Sentinels,
    text: &str,
) -> Result<Handle, Handle> {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut rest = text;
    while !rest.is_empty() {
        let first = rest.chars().next().expect("rest is non-empty");
        // Whitespace splits tokens; an escape sequence never does,
        // even `\n`, since it is decoded into the token's content.
        if first != '\\' && unicode::is_space(first as u32) {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            rest = &rest[first.len_utf8()..];
            continue;
        }
        let (codepoint, consumed) = unicode::escape_sequence(rest);
        let mut buf = [0u8; 4];
        let n = unicode::encode(codepoint, &mut buf);
        current.push_str(std::str::from_utf8(&buf[..n]).unwrap_or("\u{FFFD}"));
        rest = &rest[consumed.max(1)..];
    }
    if !current.is_empty() {
        words.push(current);
    }

    let mut out = Handle::NULL;
    for word in words.into_iter().rev() {
        let text_h = heap
            .alloc_string(&word)
            .map_err(|_| sentinels.out_of_heap)?;
        out = list::cons(heap, text_h, out, reaper).map_err(|_| sentinels.out_of_heap)?;
    }
    Ok(out)
}

/// Native-ABI entry point: pops a string off the datastack, pushes the
/// resulting token list.
pub fn tokenize_top_of_stack(
    heap: &mut Heap,
    reaper: &mut dyn LibraryReaper,
    sentinels: &Sentinels,
    datastack: &mut Handle,
) -> Result<Handle, Handle> {
    let popped = error::try_pop(heap, reaper, sentinels.out_of_heap, datastack, "tokens")?;
    let input = error::expect_tag(
        heap,
        reaper,
        sentinels.out_of_heap,
        popped,
        bowl_core::value::Tag::String,
        "tokens",
    )?;
    let text = unsafe { input.as_str() }.to_string();
    tokens(heap, reaper, sentinels, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bowl_core::heap::NoopReaper;

    fn strings_of(list: Handle) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = list;
        while !cur.is_null() {
            out.push(unsafe { cur.list_head().as_str() }.to_string());
            cur = unsafe { cur.list_tail() };
        }
        out
    }

    #[test]
    fn empty_input_yields_empty_list() {
        let mut heap = Heap::new(4096);
        let sentinels = Sentinels::install(&mut heap);
        let mut reaper = NoopReaper;
        let result = tokens(&mut heap, &mut reaper, &sentinels, "").unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn splits_on_whitespace_runs() {
        let mut heap = Heap::new(4096);
        let sentinels = Sentinels::install(&mut heap);
        let mut reaper = NoopReaper;
        let result = tokens(&mut heap, &mut reaper, &sentinels, "  foo   bar\tbaz\n").unwrap();
        assert_eq!(strings_of(result), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn decodes_escape_inside_a_token() {
        let mut heap = Heap::new(4096);
        let sentinels = Sentinels::install(&mut heap);
        let mut reaper = NoopReaper;
        let result = tokens(&mut heap, &mut reaper, &sentinels, "a\\tb").unwrap();
        assert_eq!(strings_of(result), vec!["a\tb"]);
    }
}
