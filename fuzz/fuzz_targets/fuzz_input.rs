// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::path::Path;

use tidydesk::rules::{Classifier, FileMeta, Rule};

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    rules_json: &'a str,
    file_name: &'a str,
    exceptions: Vec<&'a str>,
}

fuzz_target!(|input: Input<'_>| {
    // Rule parsing must never panic, whatever the JSON looks like
    let Ok(rules) = serde_json::from_str::<Vec<Rule>>(input.rules_json) else {
        return;
    };
    let classifier = Classifier::new(rules, input.exceptions);
    let meta = FileMeta::from_name(Path::new(input.file_name));
    let _ = classifier.classify(&meta);
});
