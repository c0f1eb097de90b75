//! Integration tests exercising the ABI, module loader and tokenizer
//! together, the way a real evaluator would drive them.

use bowl_core::heap::{Heap, NoopReaper};
use bowl_core::sentinel::Sentinels;
use bowl_core::value::Handle;
use bowl_runtime::{error, module::ModuleRegistry, tokenizer};
use serial_test::serial;

#[test]
fn stack_underflow_names_the_calling_function() {
    let mut heap = Heap::new(4096);
    let sentinels = Sentinels::install(&mut heap);
    let mut reaper = NoopReaper;
    let mut datastack = Handle::NULL;

    let err = error::try_pop(&mut heap, &mut reaper, sentinels.out_of_heap, &mut datastack, "pop-twice")
        .unwrap_err();
    let message = unsafe { err.exception_message().as_str() };
    assert!(message.contains("stack underflow"));
    assert!(message.contains("pop-twice"));
}

#[test]
#[serial]
fn loading_a_missing_module_never_registers_it() {
    let mut heap = Heap::new(8192);
    let sentinels = Sentinels::install(&mut heap);
    let mut registry = ModuleRegistry::new();
    let mut datastack = Handle::NULL;

    let path = "/no/such/bowl-module.so";
    assert!(!registry.is_loaded(path));
    let result = registry.load(&mut heap, &sentinels, &mut datastack, path);
    assert!(result.is_err());
    assert!(!registry.is_loaded(path));
}

#[test]
fn tokenizing_survives_a_forced_collection_mid_stream() {
    // Allocate enough tokens that the heap must grow/collect partway
    // through tokenizing a long input, and confirm every word survives.
    let mut heap = Heap::new(256);
    let sentinels = Sentinels::install(&mut heap);
    let mut reaper = NoopReaper;

    let words: Vec<String> = (0..50).map(|i| format!("word{i}")).collect();
    let input = words.join(" ");

    let list = tokenizer::tokens(&mut heap, &mut reaper, &sentinels, &input).unwrap();

    let mut collected = Vec::new();
    let mut cur = list;
    while !cur.is_null() {
        collected.push(unsafe { cur.list_head().as_str() }.to_string());
        cur = unsafe { cur.list_tail() };
    }
    assert_eq!(collected, words);
}
