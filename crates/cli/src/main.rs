// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use labwired_avr_config::{McuDescriptor, StopKind, TestAssertion, TestScript};
use labwired_avr_core::firmware::Firmware;
use labwired_avr_core::metrics::PerformanceMetrics;
use labwired_avr_core::signals::{SignalData, SignalFilter, SignalKind};
use labwired_avr_core::{Machine, SimulationConfig, StopReason};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const EXIT_PASS: u8 = 0;
const EXIT_ASSERT_FAIL: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

/// Upper bound on `limits.max_cycles` accepted from a test script.
const MAX_ALLOWED_CYCLES: u64 = 50_000_000_000;
/// Cycles simulated between wall-clock checks in test mode.
const WALL_CHECK_CYCLES: u64 = 100_000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a YAML test script and report the result
    Test(TestArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the firmware ELF file
    #[arg(short, long)]
    firmware: Option<PathBuf>,

    /// Path to an MCU descriptor (YAML); defaults to the built-in ATmega328P
    #[arg(short, long)]
    mcu: Option<PathBuf>,

    /// Data-space address of the console register (e.g. 0x3E)
    #[arg(short, long, value_parser = parse_u16)]
    console_register: Option<u16>,

    /// Enable instruction-level execution tracing
    #[arg(short, long, global = true)]
    trace: bool,

    /// Pace the simulation to the MCU clock frequency
    #[arg(long, global = true)]
    real_time: bool,

    /// Maximum number of cycles to simulate
    #[arg(long, default_value = "1000000")]
    max_cycles: u64,

    /// Write a JSON machine snapshot here when the run ends
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TestArgs {
    /// Path to the test script (YAML)
    #[arg(short, long)]
    script: PathBuf,

    /// Directory receiving result.json and junit.xml
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Write a JUnit report to this path
    #[arg(long)]
    junit: Option<PathBuf>,

    /// Do not echo console lines to stdout
    #[arg(long)]
    no_console_stdout: bool,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.run.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Command::Test(args)) => run_test(args, cli.run.real_time),
        None => match run_firmware(cli.run) {
            Ok(code) => code,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::from(EXIT_CONFIG_ERROR)
            }
        },
    }
}

fn load_mcu(path: Option<&Path>) -> anyhow::Result<McuDescriptor> {
    match path {
        Some(path) => {
            info!("Loading MCU descriptor: {:?}", path);
            McuDescriptor::from_file(path)
        }
        None => {
            info!("Using built-in atmega328p descriptor");
            Ok(McuDescriptor::atmega328p())
        }
    }
}

fn build_machine(
    mcu: &McuDescriptor,
    firmware: Firmware,
    console_register: Option<u16>,
    real_time: bool,
) -> anyhow::Result<Machine> {
    let firmware = match console_register {
        Some(addr) => firmware.with_console_register(addr),
        None => firmware,
    };
    let config = SimulationConfig {
        real_time,
        ..Default::default()
    };
    let mut machine = Machine::new(mcu)
        .context("Invalid MCU descriptor")?
        .with_config(config);
    machine
        .load_firmware(&firmware)
        .context("Failed to load firmware into memory")?;
    Ok(machine)
}

fn run_firmware(args: RunArgs) -> anyhow::Result<ExitCode> {
    let Some(firmware_path) = args.firmware else {
        anyhow::bail!("--firmware is required unless a subcommand is given");
    };

    info!("Starting LabWired AVR Simulator");
    let mcu = load_mcu(args.mcu.as_deref())?;

    info!("Loading firmware: {:?}", firmware_path);
    let firmware = labwired_avr_loader::read_elf(&firmware_path)?;
    let mut machine = build_machine(&mcu, firmware, args.console_register, args.real_time)?;
    if args.real_time {
        match machine.frequency() {
            Some(hz) => info!("Real-time mode at {} Hz", hz),
            None => warn!("Real-time mode requested but the MCU has no frequency"),
        }
    }

    let metrics = Arc::new(PerformanceMetrics::new());
    machine
        .signals()
        .subscribe(PerformanceMetrics::filter(), metrics.clone());

    info!("Running for at most {} cycles...", args.max_cycles);
    let reason = machine.run(Some(args.max_cycles));

    info!("Simulation stopped: {}", reason);
    info!("Final PC: {:#x}, SP: {:#06x}", machine.cpu.pc, machine.cpu.sp);
    info!(
        "Executed {} instructions in {} cycles ({:.0} IPS)",
        metrics.get_instructions(),
        machine.cycle(),
        metrics.get_ips()
    );

    if let Some(path) = args.snapshot {
        let snapshot = serde_json::to_string_pretty(&machine.snapshot())?;
        std::fs::write(&path, snapshot)
            .with_context(|| format!("Failed to write snapshot to {:?}", path))?;
        info!("Snapshot written to {:?}", path);
    }

    Ok(if reason.is_fault() {
        ExitCode::from(EXIT_RUNTIME_ERROR)
    } else {
        ExitCode::from(EXIT_PASS)
    })
}

#[derive(Serialize)]
struct AssertionResult {
    assertion: String,
    passed: bool,
}

#[derive(Serialize)]
struct RunConfig {
    firmware: String,
    mcu: String,
    max_cycles: u64,
    wall_time_ms: Option<u64>,
    real_time: bool,
}

#[derive(Serialize)]
struct TestResult {
    status: &'static str,
    stop_reason: StopKind,
    stop_detail: String,
    cycles: u64,
    pc: u32,
    firmware_hash: String,
    console: String,
    assertions: Vec<AssertionResult>,
    config: RunConfig,
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Runs to a stop condition, checking the wall clock between chunks.
fn run_limited(machine: &mut Machine, max_cycles: u64, wall: Option<Duration>) -> (StopKind, String) {
    let start = Instant::now();
    let limit = machine.cycle().saturating_add(max_cycles);
    loop {
        let chunk = (limit - machine.cycle()).min(WALL_CHECK_CYCLES);
        let reason = machine.step(chunk);
        if reason != StopReason::CycleLimit {
            return (reason.kind(), reason.to_string());
        }
        if machine.cycle() >= limit {
            return (StopKind::CycleLimit, reason.to_string());
        }
        if wall.is_some_and(|w| start.elapsed() >= w) {
            return (StopKind::WallTime, "wall time limit reached".to_string());
        }
    }
}

fn run_test(args: TestArgs, real_time: bool) -> ExitCode {
    let script = match TestScript::from_file(&args.script) {
        Ok(script) => script,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if script.limits.max_cycles > MAX_ALLOWED_CYCLES {
        error!(
            "max_cycles {} exceeds the allowed maximum of {}",
            script.limits.max_cycles, MAX_ALLOWED_CYCLES
        );
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let base = args
        .script
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let firmware_path = resolve(&base, &script.inputs.firmware);

    let setup = || -> anyhow::Result<(Machine, String, String)> {
        let mcu_path = script.inputs.mcu.as_deref().map(|m| resolve(&base, m));
        let mcu = load_mcu(mcu_path.as_deref())?;
        let bytes = std::fs::read(&firmware_path)
            .with_context(|| format!("Failed to read firmware {:?}", firmware_path))?;
        let hash = format!("{:x}", Sha256::digest(&bytes));
        let firmware =
            labwired_avr_loader::read_elf_bytes(&bytes, &firmware_path.display().to_string())?;
        let machine = build_machine(&mcu, firmware, script.inputs.console_register, real_time)?;
        Ok((machine, hash, mcu.name))
    };
    let (mut machine, firmware_hash, mcu_name) = match setup() {
        Ok(setup) => setup,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if !args.no_console_stdout {
        machine
            .signals()
            .subscribe_fn(SignalFilter::kind(SignalKind::ConsoleLine), |sig| {
                if let SignalData::Text(line) = &sig.data {
                    println!("{}", line);
                }
            });
    }

    let wall = script.limits.wall_time_ms.map(Duration::from_millis);
    let (stop_reason, stop_detail) = run_limited(&mut machine, script.limits.max_cycles, wall);
    info!("Test run stopped after {} cycles: {}", machine.cycle(), stop_detail);

    let console = machine.console().map(|c| c.output()).unwrap_or_default();
    let mut expects_stop = false;
    let assertions: Vec<AssertionResult> = script
        .assertions
        .iter()
        .map(|a| match a {
            TestAssertion::ConsoleContains(c) => AssertionResult {
                assertion: format!("console_contains: {:?}", c.console_contains),
                passed: console.contains(&c.console_contains),
            },
            TestAssertion::ExpectedStopReason(s) => {
                expects_stop = true;
                AssertionResult {
                    assertion: format!("expected_stop_reason: {:?}", s.expected_stop_reason),
                    passed: s.expected_stop_reason == stop_reason,
                }
            }
        })
        .collect();

    let faulted = matches!(
        stop_reason,
        StopKind::MemoryViolation | StopKind::DecodeError | StopKind::StackFault | StopKind::Fault
    );
    let (status, code) = if assertions.iter().any(|a| !a.passed) {
        ("fail", EXIT_ASSERT_FAIL)
    } else if faulted && !expects_stop {
        ("error", EXIT_RUNTIME_ERROR)
    } else {
        ("pass", EXIT_PASS)
    };

    let result = TestResult {
        status,
        stop_reason,
        stop_detail,
        cycles: machine.cycle(),
        pc: machine.cpu.pc,
        firmware_hash,
        console,
        assertions,
        config: RunConfig {
            firmware: firmware_path.display().to_string(),
            mcu: mcu_name,
            max_cycles: script.limits.max_cycles,
            wall_time_ms: script.limits.wall_time_ms,
            real_time,
        },
    };

    if let Err(e) = write_reports(&result, &args) {
        error!("{:#}", e);
        return ExitCode::from(EXIT_RUNTIME_ERROR);
    }

    if status == "pass" {
        info!("Test passed");
    } else {
        warn!("Test {}: stop reason {:?}", status, result.stop_reason);
    }
    ExitCode::from(code)
}

fn write_reports(result: &TestResult, args: &TestArgs) -> anyhow::Result<()> {
    let junit = junit_xml(result);
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
        std::fs::write(dir.join("result.json"), serde_json::to_string_pretty(result)?)
            .context("Failed to write result.json")?;
        std::fs::write(dir.join("junit.xml"), &junit).context("Failed to write junit.xml")?;
        info!("Reports written to {:?}", dir);
    }
    if let Some(path) = &args.junit {
        std::fs::write(path, &junit)
            .with_context(|| format!("Failed to write JUnit report to {:?}", path))?;
    }
    Ok(())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn junit_xml(result: &TestResult) -> String {
    let mut cases = Vec::new();
    if result.assertions.is_empty() {
        let failure = (result.status != "pass").then(|| result.stop_detail.clone());
        cases.push(("run".to_string(), failure));
    }
    for a in &result.assertions {
        let failure = (!a.passed).then(|| format!("{} (stopped: {})", a.assertion, result.stop_detail));
        cases.push((a.assertion.clone(), failure));
    }
    let failures = cases.iter().filter(|(_, f)| f.is_some()).count();

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<testsuite name=\"labwired-avr test\" tests=\"{}\" failures=\"{}\">\n",
        cases.len(),
        failures
    ));
    for (name, failure) in &cases {
        let name = xml_escape(name);
        match failure {
            Some(message) => xml.push_str(&format!(
                "  <testcase classname=\"labwired-avr\" name=\"{}\">\n    <failure message=\"{}\"/>\n  </testcase>\n",
                name,
                xml_escape(message)
            )),
            None => xml.push_str(&format!(
                "  <testcase classname=\"labwired-avr\" name=\"{}\"/>\n",
                name
            )),
        }
    }
    xml.push_str(&format!(
        "  <system-out>{}</system-out>\n</testsuite>\n",
        xml_escape(&result.console)
    ));
    xml
}
