//! The configuration-check engine: compile/link/run probes (feature
//! detection) executed exactly once per logical configuration.
//!
//! Checks are canonicalised by content hash before anything runs: two
//! checks probing the same thing merge into one, pooling their requested
//! macro names. Results load from a persistent per-configuration cache, so
//! a second run with the same target settings executes zero probes. The
//! unchecked remainder is linearised into a [`DagPlan`] (a probe may depend
//! on lower-level probes, e.g. every `#include` it wants to use) and runs
//! on a dedicated worker pool, each probe invoking the external
//! [`Compiler`] capability.
//!
//! Probes that produce a binary the host cannot execute (cross builds) are
//! collected for manual execution on the target: the engine copies the
//! binaries and a generated runner script into the cache directory and
//! either blocks until someone fills the results in or fails with
//! instructions.

pub mod probe;
pub mod storage;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Logger};
use std::{
    collections::HashMap,
    fmt, fs,
    io::BufRead,
    path::{Path, PathBuf},
    process::Command,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use failure::{bail, format_err, ResultExt};

use self::{
    probe::{Compiler, Probe, ProbeMode, ProbeOutcome},
    storage::{manual_path, ChecksStorage},
};
use crate::{
    session::Session,
    util::{
        clear_dir,
        errors::{CycleError, ErrorKind, ManualCheckRequired, Res},
        executor::Executor,
        graph::DagPlan,
        hash::{blake2b_512, hash_combine, shorten, str_hash},
    },
};

/// The canonical endianness probe added to every check set.
const WORDS_BIGENDIAN_SRC: &str = r#"
int IsBigEndian()
{
    volatile int i=1;
    return ! *((char *)&i);
}
int main() { return IsBigEndian(); }
"#;

/// Index of a check in the engine's arena.
pub type CheckId = usize;

// ---------------------------------------------------------------------------
// definition naming

fn make_function_var(d: &str, prefix: &str, suffix: &str) -> String {
    format!("{}{}{}", prefix, d.to_uppercase(), suffix)
}

fn make_include_var(i: &str) -> String {
    make_function_var(i, "HAVE_", "")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn make_type_var(t: &str, prefix: &str, suffix: &str) -> String {
    make_function_var(t, prefix, suffix)
        .chars()
        .map(|c| {
            if c == '*' {
                'P'
            } else if c.is_ascii_alphanumeric() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn make_struct_member_var(s: &str, m: &str) -> String {
    make_include_var(&format!("{} {}", s, m))
}

fn make_alignment_var(t: &str) -> String {
    make_type_var(t, "ALIGNOF_", "")
}

// ---------------------------------------------------------------------------
// checks

/// A caller-supplied probe body for `Custom` checks. Gets the compiler and
/// a scratch directory, returns the check value.
#[derive(Clone)]
pub struct CustomProbe(pub Arc<dyn Fn(&dyn Compiler, &Path) -> Res<i64> + Send + Sync>);

impl fmt::Debug for CustomProbe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CustomProbe(..)")
    }
}

impl PartialEq for CustomProbe {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for CustomProbe {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckKind {
    FunctionExists,
    IncludeExists,
    TypeSize,
    TypeAlignment,
    SymbolExists,
    DeclarationExists,
    StructMemberExists { member: String },
    LibraryFunctionExists { library: String },
    SourceCompiles,
    SourceLinks,
    SourceRuns,
    CompilerFlag,
    Custom(CustomProbe),
}

impl CheckKind {
    fn describe(&self) -> &'static str {
        use self::CheckKind::*;
        match self {
            FunctionExists => "function",
            IncludeExists => "include",
            TypeSize => "type",
            TypeAlignment => "alignment",
            SymbolExists => "symbol",
            DeclarationExists => "declaration",
            StructMemberExists { .. } => "struct member",
            LibraryFunctionExists { .. } => "library function",
            SourceCompiles => "source compiles",
            SourceLinks => "source links",
            SourceRuns => "source runs",
            CompilerFlag => "compiler flag",
            Custom(_) => "custom",
        }
    }

    fn probe_mode(&self) -> Option<ProbeMode> {
        use self::CheckKind::*;
        match self {
            IncludeExists | SourceCompiles | CompilerFlag => Some(ProbeMode::Compile),
            FunctionExists
            | LibraryFunctionExists { .. }
            | SymbolExists
            | DeclarationExists
            | StructMemberExists { .. }
            | SourceLinks => Some(ProbeMode::Link),
            TypeSize | TypeAlignment | SourceRuns => Some(ProbeMode::Run),
            Custom(_) => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckParameters {
    pub includes: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub options: Vec<String>,
    pub cpp: bool,
}

impl CheckParameters {
    fn hash_into(&self, mut h: u64) -> u64 {
        h = hash_combine(h, self.cpp as u64);
        for i in &self.includes {
            h = hash_combine(h, str_hash(i));
        }
        for d in &self.include_dirs {
            h = hash_combine(h, str_hash(&d.to_string_lossy()));
        }
        for l in &self.libraries {
            h = hash_combine(h, str_hash(l));
        }
        for o in &self.options {
            h = hash_combine(h, str_hash(o));
        }
        h
    }
}

/// One probe. Constructed through the [`CheckSet`] helpers; `value` is
/// written exactly once, by the worker that executes it (or from the
/// persistent cache).
#[derive(Clone, Debug)]
pub struct Check {
    pub kind: CheckKind,
    /// The primary subject: function name, header, type, source text...
    pub data: String,
    /// Macro names defined on success. The first one is the primary name
    /// used in logs and diagnostics.
    pub definitions: IndexSet<String>,
    /// Extra name prefixes under which every definition is re-exported.
    pub prefixes: IndexSet<String>,
    pub parameters: CheckParameters,
    /// Emit `NAME=0` too instead of omitting the macro on a zero value.
    pub define_if_zero: bool,
    /// Arena ids of checks that must finish first; filled by the engine.
    pub dependencies: IndexSet<CheckId>,
    pub value: Option<i64>,
    /// Set when a run-probe built a binary this host can't execute.
    pub requires_manual_setup: bool,
    pub executable: Option<PathBuf>,
}

impl Check {
    fn new(kind: CheckKind, data: &str) -> Self {
        Check {
            kind,
            data: data.to_string(),
            definitions: IndexSet::new(),
            prefixes: IndexSet::new(),
            parameters: CheckParameters::default(),
            define_if_zero: false,
            dependencies: IndexSet::new(),
            value: None,
            requires_manual_setup: false,
            executable: None,
        }
    }

    pub fn function_exists(function: &str) -> Self {
        let mut c = Check::new(CheckKind::FunctionExists, function);
        c.definitions
            .insert(make_function_var(function, "HAVE_", ""));
        c
    }

    pub fn include_exists(include: &str) -> Self {
        let mut c = Check::new(CheckKind::IncludeExists, include);
        c.definitions.insert(make_include_var(include));
        // some libs expect HAVE_SYSTIME_H and not HAVE_SYS_TIME_H
        if include.starts_with("sys/") {
            c.definitions
                .insert(make_include_var(&format!("sys{}", &include[4..])));
        }
        c
    }

    pub fn type_size(ty: &str) -> Self {
        let mut c = Check::new(CheckKind::TypeSize, ty);
        c.definitions.insert(make_type_var(ty, "HAVE_", ""));
        c.definitions.insert(make_type_var(ty, "SIZEOF_", ""));
        c.definitions.insert(make_type_var(ty, "SIZEOF_", "_CODE"));
        c.definitions.insert(make_type_var(ty, "SIZE_OF_", ""));
        c.definitions.insert(make_type_var(ty, "HAVE_SIZEOF_", ""));
        c.definitions.insert(make_type_var(ty, "HAVE_SIZE_OF_", ""));
        for h in &["sys/types.h", "stdint.h", "stddef.h", "inttypes.h"] {
            c.parameters.includes.push((*h).to_string());
        }
        c
    }

    pub fn type_alignment(ty: &str) -> Self {
        let mut c = Check::new(CheckKind::TypeAlignment, ty);
        c.definitions.insert(make_alignment_var(ty));
        for h in &[
            "sys/types.h",
            "stdint.h",
            "stddef.h",
            "stdio.h",
            "stdlib.h",
            "inttypes.h",
        ] {
            c.parameters.includes.push((*h).to_string());
        }
        c
    }

    pub fn symbol_exists(symbol: &str) -> Self {
        let mut c = Check::new(CheckKind::SymbolExists, symbol);
        c.definitions.insert(make_function_var(symbol, "HAVE_", ""));
        c
    }

    pub fn declaration_exists(decl: &str) -> Self {
        let mut c = Check::new(CheckKind::DeclarationExists, decl);
        c.definitions
            .insert(make_function_var(decl, "HAVE_DECL_", ""));
        for h in &[
            "sys/types.h",
            "stdint.h",
            "stddef.h",
            "inttypes.h",
            "stdio.h",
            "sys/stat.h",
            "stdlib.h",
            "memory.h",
            "string.h",
            "strings.h",
            "unistd.h",
        ] {
            c.parameters.includes.push((*h).to_string());
        }
        c
    }

    pub fn struct_member_exists(struct_: &str, member: &str) -> Self {
        let mut c = Check::new(
            CheckKind::StructMemberExists {
                member: member.to_string(),
            },
            struct_,
        );
        c.definitions.insert(make_struct_member_var(struct_, member));
        c
    }

    pub fn library_function_exists(library: &str, function: &str) -> Self {
        let mut c = Check::new(
            CheckKind::LibraryFunctionExists {
                library: library.to_string(),
            },
            function,
        );
        c.definitions
            .insert(make_function_var(function, "HAVE_", ""));
        c
    }

    pub fn source_compiles(def: &str, source: &str) -> Self {
        let mut c = Check::new(CheckKind::SourceCompiles, source);
        c.definitions.insert(def.to_string());
        c
    }

    pub fn source_links(def: &str, source: &str) -> Self {
        let mut c = Check::new(CheckKind::SourceLinks, source);
        c.definitions.insert(def.to_string());
        c
    }

    pub fn source_runs(def: &str, source: &str) -> Self {
        let mut c = Check::new(CheckKind::SourceRuns, source);
        c.definitions.insert(def.to_string());
        c
    }

    pub fn compiler_flag(def: &str, flag: &str) -> Self {
        let mut c = Check::new(CheckKind::CompilerFlag, "int main() {return 0;}");
        c.definitions.insert(def.to_string());
        c.parameters.options.push(flag.to_string());
        c
    }

    pub fn custom(def: &str, key: &str, probe: CustomProbe) -> Self {
        let mut c = Check::new(CheckKind::Custom(probe), key);
        c.definitions.insert(def.to_string());
        c
    }

    pub fn with_definition(mut self, def: &str) -> Self {
        self.definitions.clear();
        self.definitions.insert(def.to_string());
        self
    }

    pub fn cpp(mut self, cpp: bool) -> Self {
        self.parameters.cpp = cpp;
        self
    }

    pub fn is_checked(&self) -> bool {
        self.value.is_some()
    }

    pub fn primary_definition(&self) -> &str {
        self.definitions
            .get_index(0)
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// The build-facing form of one of this check's macros: `NAME=<value>`,
    /// or `None` when the value is zero and `define_if_zero` is unset.
    pub fn definition(&self, name: &str) -> Option<String> {
        let v = self.value?;
        if v == 0 && !self.define_if_zero {
            return None;
        }
        Some(format!("{}={}", name, v))
    }

    /// The stable identity of this probe.
    ///
    /// Frozen shape (bump the checks file name when changing any of this):
    /// `data`, then the parameters in declaration order (cpp, includes,
    /// include_dirs, libraries, options), then the cpp flag again, then the
    /// kind-specific extras (struct member, library name).
    pub fn hash(&self) -> u64 {
        let mut h = hash_combine(0, str_hash(&self.data));
        h = self.parameters.hash_into(h);
        h = hash_combine(h, self.parameters.cpp as u64);
        match &self.kind {
            CheckKind::StructMemberExists { member } => {
                h = hash_combine(h, str_hash(member));
            }
            CheckKind::LibraryFunctionExists { library } => {
                h = hash_combine(h, str_hash(library));
            }
            _ => {}
        }
        h
    }

    /// Generates the translation unit for this probe. `include_value`
    /// reports the result of the `IncludeExists` probe for a header, so the
    /// generated source only includes headers that are known to exist.
    fn source<F>(&self, include_value: F) -> String
    where
        F: Fn(&str) -> Option<i64>,
    {
        let mut includes = String::new();
        for inc in &self.parameters.includes {
            if include_value(inc).map(|v| v != 0).unwrap_or(false) {
                includes.push_str(&format!("#include <{}>\n", inc));
            }
        }

        match &self.kind {
            CheckKind::FunctionExists | CheckKind::LibraryFunctionExists { .. } => format!(
                r#"#ifdef __cplusplus
extern "C"
#endif
  char
  {f}(void);
int main(int ac, char* av[])
{{
  {f}();
  if (ac > 1000) {{
    return *av[0];
  }}
  return 0;
}}
"#,
                f = self.data
            ),
            CheckKind::IncludeExists => format!(
                "#include <{}>\nint main(void)\n{{\n  return 0;\n}}\n",
                self.data
            ),
            CheckKind::TypeSize => format!(
                "{}int main() {{ return sizeof({}); }}\n",
                includes, self.data
            ),
            CheckKind::TypeAlignment => format!(
                r#"{includes}
int main()
{{
    char diff;
    struct foo {{char a; {t} b;}};
    struct foo *p = (struct foo *) malloc(sizeof(struct foo));
    diff = ((char *)&p->b) - ((char *)&p->a);
    return diff;
}}
"#,
                includes = includes,
                t = self.data
            ),
            CheckKind::SymbolExists => format!(
                r#"{includes}
int main(int argc, char** argv)
{{
  (void)argv;
#ifndef {x}
  return ((int*)(&{x}))[argc];
#else
  (void)argc;
  return 0;
#endif
}}
"#,
                includes = includes,
                x = self.data
            ),
            CheckKind::DeclarationExists => format!(
                "{}int main() {{ (void){}; return 0; }}\n",
                includes, self.data
            ),
            CheckKind::StructMemberExists { member } => format!(
                "{}int main() {{ sizeof((({} *)0)->{}); return 0; }}\n",
                includes, self.data, member
            ),
            CheckKind::SourceCompiles
            | CheckKind::SourceLinks
            | CheckKind::SourceRuns
            | CheckKind::CompilerFlag => self.data.clone(),
            CheckKind::Custom(_) => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// target settings

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Linux,
    Macos,
    Windows,
}

impl TargetOs {
    pub fn host() -> TargetOs {
        if cfg!(windows) {
            TargetOs::Windows
        } else if cfg!(target_os = "macos") {
            TargetOs::Macos
        } else {
            TargetOs::Linux
        }
    }

    pub fn executable_extension(self) -> &'static str {
        match self {
            TargetOs::Windows => ".exe",
            _ => "",
        }
    }

    pub fn shell_extension(self) -> &'static str {
        match self {
            TargetOs::Windows => ".bat",
            _ => ".sh",
        }
    }

    fn is_batch(self) -> bool {
        self == TargetOs::Windows
    }
}

/// The logical configuration a check run is keyed by. Serialized form is
/// hashed (and shortened) to pick the persistent cache directory, so two
/// targets with identical settings share one cache.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSettings {
    /// The target (package) these checks belong to.
    pub target: String,
    pub os: TargetOs,
    #[serde(default)]
    pub values: IndexMap<String, String>,
}

impl TargetSettings {
    pub fn new(target: &str, os: TargetOs) -> Self {
        TargetSettings {
            target: target.to_string(),
            os,
            values: IndexMap::new(),
        }
    }

    pub fn config_hash(&self) -> String {
        let json = serde_json::to_string(self).expect("target settings serialize");
        shorten(&blake2b_512(json.as_bytes()), 6)
    }
}

// ---------------------------------------------------------------------------
// check sets

/// A named collection of checks attached to a build target. Handles
/// returned by the `check_*` methods are set-local and can be wired into
/// explicit dependencies with [`CheckSet::add_dependency`].
pub struct CheckSet {
    pub name: String,
    all: Vec<Check>,
    edges: Vec<(usize, usize)>,
    /// Requested definition -> arena check, filled by `perform_checks`.
    pub check_values: IndexMap<String, CheckId>,
}

impl CheckSet {
    fn new(name: &str) -> Self {
        CheckSet {
            name: name.to_string(),
            all: vec![],
            edges: vec![],
            check_values: IndexMap::new(),
        }
    }

    /// Adds a pre-built check and returns its set-local handle.
    pub fn add(&mut self, check: Check) -> usize {
        self.all.push(check);
        self.all.len() - 1
    }

    pub fn check_function_exists(&mut self, function: &str) -> usize {
        self.add(Check::function_exists(function))
    }

    pub fn check_include_exists(&mut self, include: &str) -> usize {
        self.add(Check::include_exists(include))
    }

    pub fn check_type_size(&mut self, ty: &str) -> usize {
        self.add(Check::type_size(ty))
    }

    pub fn check_type_alignment(&mut self, ty: &str) -> usize {
        self.add(Check::type_alignment(ty))
    }

    pub fn check_symbol_exists(&mut self, symbol: &str) -> usize {
        self.add(Check::symbol_exists(symbol))
    }

    pub fn check_declaration_exists(&mut self, decl: &str) -> usize {
        self.add(Check::declaration_exists(decl))
    }

    pub fn check_struct_member_exists(&mut self, struct_: &str, member: &str) -> usize {
        self.add(Check::struct_member_exists(struct_, member))
    }

    pub fn check_library_function_exists(&mut self, library: &str, function: &str) -> usize {
        self.add(Check::library_function_exists(library, function))
    }

    pub fn check_source_compiles(&mut self, def: &str, source: &str) -> usize {
        self.add(Check::source_compiles(def, source))
    }

    pub fn check_source_links(&mut self, def: &str, source: &str) -> usize {
        self.add(Check::source_links(def, source))
    }

    pub fn check_source_runs(&mut self, def: &str, source: &str) -> usize {
        self.add(Check::source_runs(def, source))
    }

    pub fn check_compiler_flag(&mut self, def: &str, flag: &str) -> usize {
        self.add(Check::compiler_flag(def, flag))
    }

    /// Mutable access to a check added to this set, for tweaking parameters
    /// before `perform_checks`.
    pub fn check_mut(&mut self, handle: usize) -> &mut Check {
        &mut self.all[handle]
    }

    /// Declares that `from` must not run before `to` has finished.
    pub fn add_dependency(&mut self, from: usize, to: usize) {
        self.edges.push((from, to));
    }

    fn contains_hash(&self, hash: u64) -> bool {
        self.all.iter().any(|c| c.hash() == hash)
    }
}

// ---------------------------------------------------------------------------
// the checker

/// Owns the check sets of a target, the compiler capability and the
/// persistent result cache, and drives [`Checker::perform_checks`].
pub struct Checker<'a> {
    session: &'a Session,
    compiler: Arc<dyn Compiler>,
    pub sets: IndexMap<String, CheckSet>,
    /// The canonical check arena, rebuilt by each `perform_checks` call.
    pub checks: Vec<Check>,
    by_hash: HashMap<u64, CheckId>,
    logger: Logger,
}

impl<'a> Checker<'a> {
    pub fn new(plog: &Logger, session: &'a Session, compiler: Arc<dyn Compiler>) -> Self {
        Checker {
            session,
            compiler,
            sets: IndexMap::new(),
            checks: vec![],
            by_hash: HashMap::new(),
            logger: plog.new(o!()),
        }
    }

    pub fn add_set(&mut self, name: &str) -> &mut CheckSet {
        if !self.sets.contains_key(name) {
            self.sets.insert(name.to_string(), CheckSet::new(name));
        }
        &mut self.sets[name]
    }

    /// The value behind a definition requested in `set`, if checked.
    pub fn value(&self, set: &str, def: &str) -> Option<i64> {
        let id = *self.sets.get(set)?.check_values.get(def)?;
        self.checks.get(id)?.value
    }

    /// The arena check behind a definition requested in `set`.
    pub fn check_for(&self, set: &str, def: &str) -> Option<&Check> {
        let id = *self.sets.get(set)?.check_values.get(def)?;
        self.checks.get(id)
    }

    /// Runs every unchecked probe of every set, exactly once per logical
    /// configuration, and persists the results.
    pub fn perform_checks(&mut self, ts: &TargetSettings) -> Res<()> {
        self.perform_inner(ts, true)
    }

    fn perform_inner(&mut self, ts: &TargetSettings, allow_manual_rerun: bool) -> Res<()> {
        let config = ts.config_hash();
        let checks_dir = self.session.layout.checks_dir(&config);
        let checks_file = checks_dir.join("checks.3.txt");

        let mut storage = ChecksStorage::default();
        storage.load(&checks_file)?;

        self.canonicalise(&storage);

        let unchecked: Vec<CheckId> = (0..self.checks.len())
            .filter(|id| !self.checks[*id].is_checked())
            .collect();

        if unchecked.is_empty() {
            if storage.new_manual_checks_loaded {
                storage.save(&checks_file)?;
            }
            self.finish(ts, &checks_dir)?;
            return Ok(());
        }

        info!(
            self.logger,
            "performing {} check(s)", unchecked.len();
            "target" => &ts.target, "config" => &config
        );
        fs::create_dir_all(&checks_dir)?;
        fs::write(
            checks_dir.join("cfg.json"),
            serde_json::to_string_pretty(ts)?,
        )?;

        let unprocessed = self.execute_unchecked(&unchecked, &mut storage, &checks_file)?;

        if !unprocessed.is_empty() {
            return self.report_cycle(&unprocessed);
        }

        for check in &self.checks {
            storage.add(check);
        }

        // stash cross-compiled binaries where the manual runner expects them
        let cc_dir = checks_dir.join("cc");
        if storage.has_pending_manual() {
            self.collect_manual_binaries(ts, &cc_dir)?;
        }

        storage.save(&checks_file)?;
        let _ = remove_dir_all::remove_dir_all(self.session.layout.checks_scratch());

        if storage.has_pending_manual() {
            return self.handle_manual(ts, &storage, &checks_file, &cc_dir, allow_manual_rerun);
        }

        self.finish(ts, &checks_dir)
    }

    /// Folds every set's checks into the canonical arena: equal hashes
    /// merge (union of definitions and prefixes), values come from storage,
    /// and each check gains edges to the `IncludeExists` probes implied by
    /// its include parameters.
    fn canonicalise(&mut self, storage: &ChecksStorage) {
        self.checks.clear();
        self.by_hash.clear();

        let set_names: Vec<String> = self.sets.keys().cloned().collect();
        for name in &set_names {
            // the built-in endianness probe joins every set
            let builtin = Check::source_runs("WORDS_BIGENDIAN", WORDS_BIGENDIAN_SRC);
            if !self.sets[name].contains_hash(builtin.hash()) {
                self.sets[name].all.push(builtin);
            }
        }

        for name in &set_names {
            let set_checks = self.sets[name].all.clone();
            let set_edges = self.sets[name].edges.clone();
            let mut local_to_arena = Vec::with_capacity(set_checks.len());

            {
                let set = &mut self.sets[name];
                set.check_values.clear();
            }

            for check in set_checks {
                let requested: Vec<String> = check
                    .definitions
                    .iter()
                    .flat_map(|d| {
                        let mut names = vec![d.clone()];
                        for p in &check.prefixes {
                            names.push(format!("{}{}", p, d));
                        }
                        names
                    })
                    .collect();

                let id = Self::intern(&mut self.checks, &mut self.by_hash, storage, check);
                local_to_arena.push(id);

                let set = &mut self.sets[name];
                for def in requested {
                    set.check_values.insert(def, id);
                }
            }

            for (from, to) in set_edges {
                let (from, to) = (local_to_arena[from], local_to_arena[to]);
                if from != to {
                    self.checks[from].dependencies.insert(to);
                }
            }
        }

        // implicit dependencies: an IncludeExists probe per include
        // parameter; the loop runs off the end into the checks it appends,
        // which themselves have no includes
        let mut id = 0;
        while id < self.checks.len() {
            let includes = self.checks[id].parameters.includes.clone();
            for inc in includes {
                let dep = Check::include_exists(&inc);
                let dep_id = Self::intern(&mut self.checks, &mut self.by_hash, storage, dep);
                if dep_id != id {
                    self.checks[id].dependencies.insert(dep_id);
                }
            }
            id += 1;
        }
    }

    fn intern(
        checks: &mut Vec<Check>,
        by_hash: &mut HashMap<u64, CheckId>,
        storage: &ChecksStorage,
        check: Check,
    ) -> CheckId {
        let hash = check.hash();
        if let Some(&id) = by_hash.get(&hash) {
            let existing = &mut checks[id];
            existing.definitions.extend(check.definitions);
            existing.prefixes.extend(check.prefixes);
            existing.define_if_zero |= check.define_if_zero;
            if existing.value.is_none() {
                existing.value = storage.all_checks.get(&hash).cloned();
            }
            return id;
        }

        let mut check = check;
        check.dependencies.clear();
        if check.value.is_none() {
            check.value = storage.all_checks.get(&hash).cloned();
        }
        let id = checks.len();
        checks.push(check);
        by_hash.insert(hash, id);
        id
    }

    /// Runs the unchecked set on a dedicated executor (never the global
    /// one: probes themselves go through the compiler, which may be using
    /// it). On a task failure the completed checks are persisted before the
    /// error propagates.
    fn execute_unchecked(
        &mut self,
        unchecked: &[CheckId],
        storage: &mut ChecksStorage,
        checks_file: &Path,
    ) -> Res<Vec<CheckId>> {
        let nodes: Vec<(CheckId, Vec<CheckId>)> = unchecked
            .iter()
            .map(|id| {
                (
                    *id,
                    self.checks[*id].dependencies.iter().cloned().collect(),
                )
            })
            .collect();
        let plan = DagPlan::new(&nodes);

        let threads = if self.session.settings.checks_single_thread {
            1
        } else {
            self.session.settings.threads
        };
        let executor = Executor::new(threads);

        let arena: Arc<Vec<Mutex<Check>>> = Arc::new(
            std::mem::replace(&mut self.checks, vec![])
                .into_iter()
                .map(Mutex::new)
                .collect(),
        );
        let by_hash = Arc::new(self.by_hash.clone());
        let compiler = self.compiler.clone();
        let scratch = self.session.layout.checks_scratch();
        let progress = Arc::new(AtomicUsize::new(0));
        let total = unchecked.len();
        let logger = self.logger.clone();

        let run_arena = arena.clone();
        let result = plan.execute(&executor, move |id| {
            run_check(
                &run_arena, &by_hash, &compiler, &scratch, &progress, total, &logger, id,
            )
        });

        // take the arena back from the workers
        self.checks = Arc::try_unwrap(arena)
            .map_err(|_| format_err!("check arena still shared after execution"))?
            .into_iter()
            .map(|m| m.into_inner().unwrap())
            .collect();

        match result {
            Ok(unprocessed) => Ok(unprocessed),
            Err(e) => {
                // record what did complete, then re-raise
                for check in &self.checks {
                    if check.is_checked() {
                        storage.add(check);
                    }
                }
                storage.save(checks_file)?;
                let _ = remove_dir_all::remove_dir_all(self.session.layout.checks_scratch());
                Err(e)
            }
        }
    }

    /// Dumps the unresolved subgraph as Graphviz and fails. Nothing is
    /// persisted: a cyclic set never ran anything.
    fn report_cycle(&self, unprocessed: &[CheckId]) -> Res<()> {
        let mut dot = String::from("digraph G {\n");
        for &id in unprocessed {
            for dep in &self.checks[id].dependencies {
                if !unprocessed.contains(dep) {
                    continue;
                }
                dot.push_str(&format!(
                    "{}->{};",
                    self.checks[id].primary_definition(),
                    self.checks[*dep].primary_definition()
                ));
            }
        }
        dot.push_str("\n}");

        let dir = self.session.layout.cyclic_dir();
        fs::create_dir_all(&dir)?;
        let dot_file = dir.join("deps_checks.dot");
        fs::write(&dot_file, dot)?;

        Err(CycleError {
            dot_file: dot_file.display().to_string(),
        }
        .into())
    }

    fn collect_manual_binaries(&self, ts: &TargetSettings, cc_dir: &Path) -> Res<()> {
        clear_dir(cc_dir)?;
        for check in &self.checks {
            if !check.requires_manual_setup {
                continue;
            }
            if let Some(exe) = &check.executable {
                let dst = cc_dir.join(format!(
                    "{}{}",
                    check.hash(),
                    ts.os.executable_extension()
                ));
                if !dst.exists() {
                    fs::copy(exe, &dst).with_context(|e| {
                        format_err!("couldn't stash check binary {}:\n{}", exe.display(), e)
                    })?;
                }
            }
        }
        Ok(())
    }

    /// The manual-check tail: write the runner script, then either block
    /// for the results (re-running once after they arrive) or fail with
    /// instructions. Serialised per session so parallel targets don't race
    /// on the sidecar.
    fn handle_manual(
        &mut self,
        ts: &TargetSettings,
        storage: &ChecksStorage,
        checks_file: &Path,
        cc_dir: &Path,
        allow_rerun: bool,
    ) -> Res<()> {
        {
            // the gate must be released before re-entering perform_inner
            let _gate = self.session.manual_gate.lock().unwrap();

            let runner = self.write_manual_runner(ts, storage, checks_file, cc_dir)?;

            if !(self.session.settings.wait_for_cc_checks && allow_rerun) {
                return Err(ManualCheckRequired {
                    sidecar: manual_path(checks_file).display().to_string(),
                    cc_dir: cc_dir.display().to_string(),
                }
                .into());
            }

            if let Some(cmd) = self.session.settings.cc_checks_command.clone() {
                info!(self.logger, "running manual checks"; "command" => &cmd);
                let status = Command::new(if cfg!(windows) { "cmd" } else { "sh" })
                    .arg(if cfg!(windows) { "/C" } else { "-c" })
                    .arg(&cmd)
                    .current_dir(cc_dir)
                    .status()?;
                if !status.success() {
                    bail!(
                        "{}: cc_checks_command exited abnormally: {}",
                        ErrorKind::CheckExecution,
                        status
                    )
                }
            } else {
                println!("waiting for manual checks to complete");
                println!(
                    "run {} on the target host, then press enter to continue...",
                    runner.display()
                );
                let mut line = String::new();
                let stdin = std::io::stdin();
                stdin.lock().read_line(&mut line)?;
            }
        }

        self.perform_inner(ts, false)
    }

    /// Generates `cc/run.sh` (or `run.bat`) which executes every pending
    /// binary on the target host and appends `<hash> <exit code>` lines to
    /// the manual sidecar.
    fn write_manual_runner(
        &self,
        ts: &TargetSettings,
        storage: &ChecksStorage,
        checks_file: &Path,
        cc_dir: &Path,
    ) -> Res<PathBuf> {
        let sidecar_name = manual_path(checks_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let out = if self.session.settings.wait_for_cc_checks {
            format!("../{}", sidecar_name)
        } else {
            sidecar_name
        };

        let bat = ts.os.is_batch();
        let ext = ts.os.executable_extension();
        let mut script = String::new();

        if bat {
            script.push_str("@echo off\r\n");
            script.push_str(&format!("set OUT={}\r\n", out.replace('/', "\\")));
            script.push_str("type nul > %OUT%\r\n");
        } else {
            script.push_str("#!/bin/sh\n\n");
            script.push_str(&format!("OUT=\"{}\"\n", out));
            script.push_str(": > \"$OUT\"\n");
        }

        for (hash, definitions) in &storage.manual_checks {
            let defs = definitions.join(" ");
            let bin = format!("{}{}", hash, ext);
            if bat {
                script.push_str(&format!(":: {}\r\n", defs));
                script.push_str(&format!("if not exist {} exit /b 1\r\n", bin));
                script.push_str(&format!("echo checking: {}\r\n", defs));
                script.push_str(&format!("{}\r\n", bin));
                script.push_str(&format!("echo {} %errorlevel% >> %OUT%\r\n\r\n", hash));
            } else {
                script.push_str(&format!("# {}\n", defs));
                script.push_str(&format!(
                    "if [ ! -f {bin} ]; then\n    echo \"missing file: {bin}\"\n    exit 1\nfi\n",
                    bin = bin
                ));
                script.push_str(&format!("echo \"checking: {}\"\n", defs));
                script.push_str(&format!("chmod 755 {}\n", bin));
                script.push_str(&format!("./{}\n", bin));
                script.push_str(&format!("echo \"{} $?\" >> \"$OUT\"\n\n", hash));
            }
        }

        let runner = cc_dir.join(format!("run{}", ts.os.shell_extension()));
        fs::write(&runner, script)?;
        Ok(runner)
    }

    /// Post-run bookkeeping: the per-target dump when `print_checks` is on.
    fn finish(&mut self, ts: &TargetSettings, checks_dir: &Path) -> Res<()> {
        if !self.session.settings.print_checks {
            return Ok(());
        }
        for set in self.sets.values() {
            let mut lines: Vec<String> = vec![];
            let mut sorted: Vec<(&String, &CheckId)> = set.check_values.iter().collect();
            sorted.sort();
            for (def, id) in sorted {
                let check = &self.checks[*id];
                if let Some(v) = check.value {
                    lines.push(format!("{} {} {}", def, v, check.hash()));
                }
            }
            let path = checks_dir.join(format!("{}.{}.txt", ts.target, set.name));
            fs::write(&path, lines.join("\n") + "\n")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// probe execution

#[allow(clippy::too_many_arguments)]
fn run_check(
    arena: &Arc<Vec<Mutex<Check>>>,
    by_hash: &Arc<HashMap<u64, CheckId>>,
    compiler: &Arc<dyn Compiler>,
    scratch: &Path,
    progress: &Arc<AtomicUsize>,
    total: usize,
    logger: &Logger,
    id: CheckId,
) -> Res<()> {
    // snapshot under a short lock; the check is ours to mutate but deps may
    // be read by siblings
    let snapshot = {
        let check = arena[id].lock().unwrap();
        if check.is_checked() {
            return Ok(());
        }
        check.clone()
    };

    let step = progress.fetch_add(1, Ordering::SeqCst) + 1;
    let log_string = format!("[{}/{}]", step, total);

    let hash = snapshot.hash();
    let dir = scratch.join(format!("{:016x}", hash));
    fs::create_dir_all(&dir)?;

    if let CheckKind::Custom(probe) = &snapshot.kind {
        let value = (probe.0)(compiler.as_ref(), &dir)?;
        let mut check = arena[id].lock().unwrap();
        check.value = Some(value);
        debug!(logger, "{} checked custom {}: {}", log_string,
               check.primary_definition(), value);
        return Ok(());
    }

    // dependency probes finished before us, so their values are readable
    let include_value = |inc: &str| -> Option<i64> {
        let dep_hash = Check::include_exists(inc).hash();
        by_hash
            .get(&dep_hash)
            .and_then(|dep_id| arena[*dep_id].lock().unwrap().value)
    };

    let source = snapshot.source(include_value);
    let file = dir.join(if snapshot.parameters.cpp { "x.cpp" } else { "x.c" });
    fs::write(&file, source)?;

    let mode = snapshot
        .kind
        .probe_mode()
        .expect("non-custom checks have a probe mode");
    let mut libraries = snapshot.parameters.libraries.clone();
    if let CheckKind::LibraryFunctionExists { library } = &snapshot.kind {
        libraries.push(library.clone());
    }

    let outcome = compiler.probe(&Probe {
        source: &file,
        mode,
        cpp: snapshot.parameters.cpp,
        include_dirs: &snapshot.parameters.include_dirs,
        libraries: &libraries,
        options: &snapshot.parameters.options,
        out_dir: &dir,
    })?;

    let mut check = arena[id].lock().unwrap();
    match (mode, outcome) {
        (_, ProbeOutcome::Failed) => check.value = Some(0),
        (ProbeMode::Compile, ProbeOutcome::Built) | (ProbeMode::Link, ProbeOutcome::Built) => {
            check.value = Some(1)
        }
        (ProbeMode::Run, ProbeOutcome::Ran(code)) => check.value = Some(i64::from(code)),
        (ProbeMode::Run, ProbeOutcome::CrossCompiled(exe)) => {
            check.requires_manual_setup = true;
            check.executable = Some(exe);
        }
        (mode, outcome) => bail!(
            "{}: check {}: compiler returned {:?} for a {:?} probe",
            ErrorKind::CheckExecution,
            check.primary_definition(),
            outcome,
            mode
        ),
    }

    if check.value.is_none() {
        if check.requires_manual_setup {
            info!(
                logger,
                "{} check {} requires manual setup", log_string,
                check.primary_definition()
            );
            return Ok(());
        }
        bail!(
            "{}: check {}: value was not set",
            ErrorKind::CheckExecution,
            check.primary_definition()
        )
    }

    debug!(
        logger,
        "{} checked {} {}: {}",
        log_string,
        check.kind.describe(),
        check.primary_definition(),
        check.value.unwrap()
    );
    Ok(())
}
