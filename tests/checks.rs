//! Check engine scenarios: canonicalisation and merging, persistent-cache
//! idempotency, cycle detection and the manual (cross-compile) flow, all
//! against a scripted compiler.

use quarry::{
    checks::{
        probe::{Compiler, Probe, ProbeMode, ProbeOutcome},
        Check, Checker, CustomProbe, TargetOs, TargetSettings,
    },
    config::Settings,
    session::Session,
    util::errors::{is_cycle, Res},
};

use slog::{o, Discard, Logger};
use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tempdir::TempDir;

fn logger() -> Logger {
    Logger::root(Discard, o!())
}

fn session(root: &Path, settings: Settings) -> Session {
    Session::new(&logger(), root, settings, vec![]).unwrap()
}

fn settings() -> Settings {
    let mut s = Settings::default();
    s.threads = 4;
    s
}

/// A compiler scripted off the probe source text:
/// - compile probes fail when the source includes a header containing
///   `missing`;
/// - link probes fail when the source references `nonexistent`;
/// - run probes return canned exit codes (or report a cross build when
///   `cross` is set).
struct FakeCompiler {
    probes: AtomicUsize,
    cross: bool,
}

impl FakeCompiler {
    fn new(cross: bool) -> Self {
        FakeCompiler {
            probes: AtomicUsize::new(0),
            cross,
        }
    }

    fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.probes.store(0, Ordering::SeqCst);
    }
}

impl Compiler for FakeCompiler {
    fn probe(&self, probe: &Probe<'_>) -> Res<ProbeOutcome> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let source = fs::read_to_string(probe.source)?;

        Ok(match probe.mode {
            ProbeMode::Compile => {
                if source.contains("#include <missing") {
                    ProbeOutcome::Failed
                } else {
                    ProbeOutcome::Built
                }
            }
            ProbeMode::Link => {
                if source.contains("nonexistent") {
                    ProbeOutcome::Failed
                } else {
                    ProbeOutcome::Built
                }
            }
            ProbeMode::Run => {
                if self.cross {
                    let exe = probe.out_dir.join("probe");
                    fs::write(&exe, b"\x7fELF not for this host")?;
                    ProbeOutcome::CrossCompiled(exe)
                } else if source.contains("sizeof(size_t)") {
                    ProbeOutcome::Ran(8)
                } else {
                    // the endianness probe and friends
                    ProbeOutcome::Ran(0)
                }
            }
        })
    }
}

fn target() -> TargetSettings {
    TargetSettings::new("org.example.app-1.0.0", TargetOs::Linux)
}

#[test]
fn merged_checks_probe_once_and_cache_forever() {
    let root = TempDir::new("checks").unwrap();
    let session = session(root.path(), settings());
    let fake = Arc::new(FakeCompiler::new(false));
    let mut checker = Checker::new(&logger(), &session, fake.clone());

    // two sets request the same probe under different macro names
    checker
        .add_set("core")
        .check_function_exists("memcpy");
    checker
        .add_set("extra")
        .add(Check::function_exists("memcpy").with_definition("MY_MEMCPY"));

    let ts = target();
    checker.perform_checks(&ts).unwrap();

    // one link probe for memcpy plus one run probe for the built-in
    // endianness check shared by both sets
    assert_eq!(fake.probe_count(), 2);
    assert_eq!(checker.value("core", "HAVE_MEMCPY"), Some(1));
    assert_eq!(checker.value("extra", "MY_MEMCPY"), Some(1));
    assert_eq!(checker.value("core", "WORDS_BIGENDIAN"), Some(0));

    // merging pooled the definitions onto one check
    let merged = checker.check_for("core", "HAVE_MEMCPY").unwrap();
    assert!(merged.definitions.contains("HAVE_MEMCPY"));
    assert!(merged.definitions.contains("MY_MEMCPY"));

    // a second run with the same settings executes zero probes
    fake.reset();
    checker.perform_checks(&ts).unwrap();
    assert_eq!(fake.probe_count(), 0);
    assert_eq!(checker.value("core", "HAVE_MEMCPY"), Some(1));
    assert_eq!(checker.value("extra", "MY_MEMCPY"), Some(1));
}

#[test]
fn persisted_file_matches_check_hashes() {
    let root = TempDir::new("checks").unwrap();
    let session = session(root.path(), settings());
    let fake = Arc::new(FakeCompiler::new(false));
    let mut checker = Checker::new(&logger(), &session, fake);

    let set = checker.add_set("core");
    set.check_function_exists("memcpy");
    set.check_function_exists("nonexistent_fn");
    set.check_include_exists("stdio.h");
    set.check_include_exists("missing.h");

    let ts = target();
    checker.perform_checks(&ts).unwrap();

    let file = session
        .layout
        .checks_dir(&ts.config_hash())
        .join("checks.3.txt");
    let contents = fs::read_to_string(&file).unwrap();

    let mut lines = 0;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let hash: u64 = parts.next().unwrap().parse().unwrap();
        let value: i64 = parts.next().unwrap().parse().unwrap();
        let check = checker
            .checks
            .iter()
            .find(|c| c.hash() == hash)
            .expect("a persisted hash with no matching check");
        assert_eq!(check.value, Some(value));
        lines += 1;
    }
    assert_eq!(lines, checker.checks.len());

    // negative probes persisted as zero
    assert_eq!(checker.value("core", "HAVE_NONEXISTENT_FN"), Some(0));
    assert_eq!(checker.value("core", "HAVE_MISSING_H"), Some(0));
    assert_eq!(checker.value("core", "HAVE_STDIO_H"), Some(1));
}

#[test]
fn type_size_comes_from_the_exit_code() {
    let root = TempDir::new("checks").unwrap();
    let session = session(root.path(), settings());
    let fake = Arc::new(FakeCompiler::new(false));
    let mut checker = Checker::new(&logger(), &session, fake);

    checker.add_set("core").check_type_size("size_t");
    checker.perform_checks(&target()).unwrap();

    assert_eq!(checker.value("core", "SIZEOF_SIZE_T"), Some(8));
    assert_eq!(checker.value("core", "HAVE_SIZEOF_SIZE_T"), Some(8));
    // the implicit include probes ran and succeeded
    assert_eq!(checker.value("core", "HAVE_STDINT_H"), None); // not requested by the user
    let stdint = Check::include_exists("stdint.h");
    let found = checker.checks.iter().find(|c| c.hash() == stdint.hash());
    assert_eq!(found.and_then(|c| c.value), Some(1));
}

#[test]
fn custom_checks_use_the_supplied_probe() {
    let root = TempDir::new("checks").unwrap();
    let session = session(root.path(), settings());
    let fake = Arc::new(FakeCompiler::new(false));
    let mut checker = Checker::new(&logger(), &session, fake);

    let probe = CustomProbe(Arc::new(|_compiler, _scratch| Ok(42)));
    checker
        .add_set("core")
        .add(Check::custom("ANSWER", "custom.answer", probe));
    checker.perform_checks(&target()).unwrap();

    assert_eq!(checker.value("core", "ANSWER"), Some(42));
}

#[test]
fn cyclic_dependencies_dump_graphviz_and_fail() {
    let root = TempDir::new("checks").unwrap();
    let session = session(root.path(), settings());
    let fake = Arc::new(FakeCompiler::new(false));
    let mut checker = Checker::new(&logger(), &session, fake);

    let set = checker.add_set("core");
    let a = set.check_source_compiles("CHECK_A", "int main() { return 0; }");
    let b = set.check_source_compiles("CHECK_B", "int main() { return 1; }");
    set.add_dependency(a, b);
    set.add_dependency(b, a);

    let ts = target();
    let err = checker.perform_checks(&ts).unwrap_err();
    assert!(is_cycle(&err), "expected a cycle error, got: {}", err);

    let dot = fs::read_to_string(
        session
            .layout
            .cyclic_dir()
            .join("deps_checks.dot"),
    )
    .unwrap();
    assert!(dot.contains("CHECK_A->CHECK_B;"));
    assert!(dot.contains("CHECK_B->CHECK_A;"));

    // nothing was persisted
    let file = session
        .layout
        .checks_dir(&ts.config_hash())
        .join("checks.3.txt");
    assert!(!file.exists());
}

#[test]
fn explicit_dependencies_order_execution() {
    let root = TempDir::new("checks").unwrap();
    let session = session(root.path(), settings());
    let fake = Arc::new(FakeCompiler::new(false));
    let mut checker = Checker::new(&logger(), &session, fake);

    let set = checker.add_set("core");
    let first = set.check_source_compiles("CHECK_FIRST", "int main() { return 0; }");
    let second = set.check_source_compiles("CHECK_SECOND", "int main() { return 2; }");
    set.add_dependency(second, first);

    checker.perform_checks(&target()).unwrap();
    assert_eq!(checker.value("core", "CHECK_FIRST"), Some(1));
    assert_eq!(checker.value("core", "CHECK_SECOND"), Some(1));
}

#[test]
fn manual_checks_round_trip_through_the_sidecar() {
    let root = TempDir::new("checks").unwrap();
    let session = session(root.path(), settings());
    // every run probe reports a binary this host can't execute
    let fake = Arc::new(FakeCompiler::new(true));
    let mut checker = Checker::new(&logger(), &session, fake.clone());

    checker
        .add_set("core")
        .check_source_runs("RUNS_ON_TARGET", "int main() { return 7; }");

    let ts = target();
    let err = checker.perform_checks(&ts).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("manually"), "unexpected error: {}", msg);

    let checks_dir = session.layout.checks_dir(&ts.config_hash());
    let sidecar = checks_dir.join("checks.3.txt.manual.txt");
    let sidecar_text = fs::read_to_string(&sidecar).unwrap();
    assert!(sidecar_text.contains("RUNS_ON_TARGET"));
    assert!(sidecar_text.contains(" ?"));

    // binaries and the runner script were staged for the target host
    let cc = checks_dir.join("cc");
    assert!(cc.join("run.sh").exists());
    let runner = fs::read_to_string(cc.join("run.sh")).unwrap();
    assert!(runner.starts_with("#!/bin/sh"));
    let binaries: Vec<_> = fs::read_dir(&cc)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "run.sh")
        .collect();
    // one per pending check: the user probe and the built-in endianness one
    assert_eq!(binaries.len(), 2);

    // simulate running the probes on the target: RUNS_ON_TARGET exits 7,
    // the endianness probe exits 0
    let filled = sidecar_text
        .lines()
        .map(|line| {
            if !line.ends_with(" ?") {
                return line.to_string();
            }
            let hash = line.split_whitespace().next().unwrap();
            if sidecar_text
                .lines()
                .zip(sidecar_text.lines().skip(1))
                .any(|(c, l)| c.contains("RUNS_ON_TARGET") && l == line)
            {
                format!("{} 7", hash)
            } else {
                format!("{} 0", hash)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(&sidecar, filled).unwrap();

    // with the sidecar filled in, the next run loads the values and
    // executes nothing new
    fake.reset();
    checker.perform_checks(&ts).unwrap();
    assert_eq!(fake.probe_count(), 0);
    assert_eq!(checker.value("core", "RUNS_ON_TARGET"), Some(7));
    assert_eq!(checker.value("core", "WORDS_BIGENDIAN"), Some(0));

    // and the resolved entries migrated into the main file
    let main = fs::read_to_string(checks_dir.join("checks.3.txt")).unwrap();
    assert!(main.lines().count() >= 2);
}

#[test]
fn print_checks_dumps_per_set_files() {
    let root = TempDir::new("checks").unwrap();
    let mut s = settings();
    s.print_checks = true;
    let session = session(root.path(), s);
    let fake = Arc::new(FakeCompiler::new(false));
    let mut checker = Checker::new(&logger(), &session, fake);

    checker.add_set("core").check_function_exists("memcpy");
    let ts = target();
    checker.perform_checks(&ts).unwrap();

    let dump = session
        .layout
        .checks_dir(&ts.config_hash())
        .join("org.example.app-1.0.0.core.txt");
    let text = fs::read_to_string(&dump).unwrap();
    let memcpy = Check::function_exists("memcpy");
    assert!(text.contains(&format!("HAVE_MEMCPY 1 {}", memcpy.hash())));
}
