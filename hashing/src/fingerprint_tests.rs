// Copyright 2024 Keel Build contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use serde_json::json;

use crate::{fingerprint_json, Fingerprint};

#[test]
fn hex_round_trip() {
    let fingerprint = Fingerprint::of_bytes(b"some bytes");
    assert_eq!(
        Fingerprint::from_hex_string(&fingerprint.to_hex()).unwrap(),
        fingerprint
    );
}

#[test]
fn from_hex_string_rejects_garbage() {
    assert!(Fingerprint::from_hex_string("not hex").is_err());
    assert!(Fingerprint::from_hex_string("abcd").is_err());
}

#[test]
fn display_is_hex() {
    let fingerprint = Fingerprint::of_bytes(b"");
    assert_eq!(
        format!("{fingerprint}"),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn serde_round_trips_as_hex() {
    let fingerprint = Fingerprint::of_bytes(b"value");
    let encoded = serde_json::to_string(&fingerprint).unwrap();
    assert_eq!(encoded, format!("\"{}\"", fingerprint.to_hex()));
    assert_eq!(
        serde_json::from_str::<Fingerprint>(&encoded).unwrap(),
        fingerprint
    );
}

#[test]
fn json_fingerprint_ignores_key_order() {
    let left = json!({"mode": "production", "targets": ["es2020"]});
    let right: serde_json::Value =
        serde_json::from_str(r#"{"targets": ["es2020"], "mode": "production"}"#).unwrap();
    assert_eq!(
        fingerprint_json(&left).unwrap(),
        fingerprint_json(&right).unwrap()
    );
}

#[test]
fn json_fingerprint_distinguishes_values() {
    let left = json!({"mode": "production"});
    let right = json!({"mode": "development"});
    assert_ne!(
        fingerprint_json(&left).unwrap(),
        fingerprint_json(&right).unwrap()
    );
}
