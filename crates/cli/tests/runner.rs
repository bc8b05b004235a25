// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::process::Command;

#[test]
fn test_cli_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_labwired-avr"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("--firmware"));
    assert!(stdout.contains("test"));
}

#[test]
fn test_cli_load_missing_file() {
    let output = Command::new(env!("CARGO_BIN_EXE_labwired-avr"))
        .arg("-f")
        .arg("non_existent_file.elf")
        .output()
        .expect("Failed to execute command");

    // It should fail because file is missing
    assert!(!output.status.success());
}

#[test]
fn test_cli_rejects_bad_console_register() {
    let output = Command::new(env!("CARGO_BIN_EXE_labwired-avr"))
        .args(["-f", "x.elf", "--console-register", "0xZZ"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
}
