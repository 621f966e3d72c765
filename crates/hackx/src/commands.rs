use colored::Colorize;
use hack_vm::{key_code, parse, ParsedFile, Program, Status, Vm, Word};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One named source file, as exchanged with the compile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct CompileResponse {
    #[serde(default)]
    vm: Vec<SourceFile>,
    #[serde(default)]
    asm: String,
    #[serde(default)]
    hack: String,
    error: Option<String>,
}

pub struct RunOpts {
    pub entry: Option<String>,
    pub max_steps: u64,
    pub keys: Vec<String>,
    pub dump: Option<String>,
    pub digest: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            entry: None,
            max_steps: 10_000_000,
            keys: Vec::new(),
            dump: None,
            digest: false,
        }
    }
}

// ── loading ─────────────────────────────────────────────────────

/// Files as given; directories expand to their `ext` files, sorted by name.
fn expand(paths: &[String], ext: &str) -> Result<Vec<PathBuf>, String> {
    let mut out = Vec::new();
    for p in paths {
        let path = Path::new(p);
        if path.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(path)
                .map_err(|e| format!("read {p}: {e}"))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|f| f.is_file() && f.extension().is_some_and(|x| x == ext))
                .collect();
            found.sort();
            out.extend(found);
        } else {
            out.push(path.to_path_buf());
        }
    }
    if out.is_empty() {
        return Err(format!("no .{ext} files found"));
    }
    Ok(out)
}

fn read_sources(paths: &[String], ext: &str) -> Result<Vec<SourceFile>, String> {
    expand(paths, ext)?
        .into_iter()
        .map(|path| {
            let content = fs::read_to_string(&path)
                .map_err(|e| format!("read {}: {e}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(SourceFile { name, content })
        })
        .collect()
}

fn parse_sources(sources: &[SourceFile]) -> Result<Vec<ParsedFile>, String> {
    sources
        .iter()
        .map(|s| {
            parse(&s.content, &s.name).map_err(|e| {
                eprint!("{}", e.render(&s.content));
                format!("parse: {e}")
            })
        })
        .collect()
}

fn link(files: &[ParsedFile], entry: Option<&str>) -> Result<Program, String> {
    let program = Program::link(files).map_err(|e| format!("link: {e}"))?;
    match entry {
        Some(name) => program.with_entry(name).map_err(|e| format!("link: {e}")),
        None => Ok(program),
    }
}

fn load(paths: &[String], entry: Option<&str>) -> Result<Program, String> {
    let sources = read_sources(paths, "vm")?;
    link(&parse_sources(&sources)?, entry)
}

// ── check ───────────────────────────────────────────────────────

pub fn check(paths: &[String], entry: Option<&str>) -> Result<(), String> {
    let program = load(paths, entry)?;

    println!("{} {}", "Entry:       ".dimmed(), program.entry().name.cyan());
    println!(
        "{} {} functions, {} instructions",
        "Program:     ".dimmed(),
        program.functions().len(),
        program.len()
    );
    println!();
    println!("{}", "Functions:".bold());
    for f in program.functions() {
        println!(
            "  {:<32} {:>5}..{:<5} {} locals  {}",
            f.name.blue(),
            f.start,
            f.end,
            f.locals,
            program.files()[f.file].name.dimmed()
        );
    }
    println!();
    println!("{}", "Statics:".bold());
    for file in program.files() {
        if file.static_count == 0 {
            println!("  {:<32} {}", file.name, "—".dimmed());
        } else {
            println!(
                "  {:<32} {}..{}  ({} words)",
                file.name,
                file.static_base,
                file.static_base + file.static_count - 1,
                file.static_count
            );
        }
    }
    println!("\n{}", "OK".green().bold());
    Ok(())
}

// ── fmt / disasm ────────────────────────────────────────────────

pub fn fmt(file: &str) -> Result<(), String> {
    let sources = read_sources(&[file.to_string()], "vm")?;
    for parsed in parse_sources(&sources)? {
        print!("{}", parsed.to_source());
    }
    Ok(())
}

pub fn disasm(paths: &[String]) -> Result<(), String> {
    let program = load(paths, None)?;
    print!("{}", program.listing());
    Ok(())
}

// ── run ─────────────────────────────────────────────────────────

/// Integer code, key name or single character.
fn parse_key(s: &str) -> Result<Word, String> {
    if let Ok(code) = s.parse::<Word>() {
        return Ok(code);
    }
    key_code(s).ok_or_else(|| format!("unknown key '{s}'"))
}

/// `ADDR:LEN`
fn parse_dump(s: &str) -> Result<(i32, usize), String> {
    let (addr, len) = s
        .split_once(':')
        .ok_or_else(|| format!("dump range must be ADDR:LEN, got '{s}'"))?;
    let addr = addr.trim().parse().map_err(|_| format!("bad dump address '{addr}'"))?;
    let len = len.trim().parse().map_err(|_| format!("bad dump length '{len}'"))?;
    Ok((addr, len))
}

/// Drives the VM one host tick at a time; each scripted key is held for one tick.
fn drive(vm: &mut Vm, keys: &[Word], max_steps: u64, tick: u64) {
    let mut remaining = max_steps;
    let mut pending = keys.iter();
    vm.run();
    while remaining > 0 && vm.status() == &Status::Running {
        match pending.next() {
            Some(&key) => vm.set_keyboard(key),
            None if !keys.is_empty() => vm.set_keyboard(0),
            None => {}
        }
        let report = vm.run_for(tick.min(remaining));
        remaining -= report.steps.min(remaining);
    }
    vm.pause();
}

pub fn run(paths: &[String], opts: &RunOpts) -> Result<(), String> {
    let program = load(paths, opts.entry.as_deref())?;
    execute(program, opts)
}

fn execute(program: Program, opts: &RunOpts) -> Result<(), String> {
    let keys = opts
        .keys
        .iter()
        .map(|k| parse_key(k))
        .collect::<Result<Vec<_>, _>>()?;
    let dump = opts.dump.as_deref().map(parse_dump).transpose()?;

    let mut vm = Vm::new(program);
    drive(&mut vm, &keys, opts.max_steps, *hack_config::STEPS_PER_TICK);

    let badge = match vm.status() {
        Status::Halted(_) => "HALTED".green().bold(),
        Status::Error(_) => "FAULT".red().bold(),
        other => other.as_str().to_uppercase().yellow().bold(),
    };
    println!("{} {}", "Status:  ".dimmed(), badge);
    println!("{} {}", "Steps:   ".dimmed(), vm.steps());
    if let Status::Halted(code) = vm.status() {
        println!("{} {}", "Exit:    ".dimmed(), code.to_string().cyan());
    }
    let top = vm.read(vm.stack_pointer() - 1).ok();
    println!(
        "{} SP={} top={}",
        "Stack:   ".dimmed(),
        vm.stack_pointer(),
        top.map(|v| v.to_string()).unwrap_or_else(|| "—".into())
    );

    if let Some((addr, len)) = dump {
        let words = vm.read_range(addr, len).map_err(|e| format!("dump: {e}"))?;
        println!();
        for (row, chunk) in words.chunks(8).enumerate() {
            let cells: Vec<String> = chunk.iter().map(|w| format!("{w:>6}")).collect();
            println!("  {:>5}: {}", addr + row as i32 * 8, cells.join(" "));
        }
    }
    if opts.digest {
        println!("{} {}", "Digest:  ".dimmed(), vm.digest().dimmed());
    }

    match vm.status() {
        Status::Halted(_) => Ok(()),
        Status::Error(fault) => {
            println!();
            println!("{}", "Backtrace:".bold());
            for name in vm.backtrace() {
                println!("  {}", name.blue());
            }
            Err(format!("runtime: {fault}"))
        }
        _ => Err(format!(
            "runtime: no halt within {} steps (at pc {} in {})",
            opts.max_steps,
            vm.pc(),
            vm.current_function()
        )),
    }
}

// ── compile ─────────────────────────────────────────────────────

/// A name from the compile service, accepted only as a bare file name.
fn output_name(name: &str) -> Result<&str, String> {
    let path = Path::new(name);
    match (path.file_name(), path.components().count()) {
        (Some(file), 1) if file == name => Ok(name),
        _ => Err(format!("compile: refusing output name '{name}' outside the output directory")),
    }
}

/// Writes every `(name, content)` into `dir`. All names are checked before anything is written.
fn write_outputs(dir: &Path, outputs: &[(&str, &str)]) -> Result<Vec<PathBuf>, String> {
    let paths = outputs
        .iter()
        .map(|(name, _)| output_name(name).map(|n| dir.join(n)))
        .collect::<Result<Vec<_>, _>>()?;
    fs::create_dir_all(dir).map_err(|e| format!("write {}: {e}", dir.display()))?;
    for (path, (_, content)) in paths.iter().zip(outputs) {
        fs::write(path, content).map_err(|e| format!("write {}: {e}", path.display()))?;
    }
    Ok(paths)
}

pub fn compile(base: &str, files: &[String], out: Option<&str>, run: bool) -> Result<(), String> {
    let sources = read_sources(files, "jack")?;
    let url = format!("{}/compile", base.trim_end_matches('/'));
    let body = serde_json::json!({ "files": sources });

    let resp = reqwest::blocking::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .map_err(|e| format!("compile: request failed: {e}"))?;
    let status = resp.status();
    let reply: CompileResponse = resp
        .json()
        .map_err(|e| format!("compile: parse response: {e}"))?;

    if let Some(err) = reply.error {
        return Err(format!("compile: {err}"));
    }
    if !status.is_success() {
        return Err(format!("compile: HTTP {}", status.as_u16()));
    }

    let mut vm_files = reply.vm;
    vm_files.sort_by(|a, b| a.name.cmp(&b.name));
    println!("{} {} VM file(s)", "Compiled:".green().bold(), vm_files.len());
    for f in &vm_files {
        println!("  {} {} lines", f.name.cyan(), f.content.lines().count());
    }

    if let Some(dir) = out {
        let mut outputs: Vec<(&str, &str)> = vm_files
            .iter()
            .map(|f| (f.name.as_str(), f.content.as_str()))
            .collect();
        if !reply.asm.is_empty() {
            outputs.push(("program.asm", reply.asm.as_str()));
        }
        if !reply.hack.is_empty() {
            outputs.push(("program.hack", reply.hack.as_str()));
        }
        for path in write_outputs(Path::new(dir), &outputs)? {
            println!("  {} {}", "wrote".dimmed(), path.display());
        }
    }

    if run {
        println!();
        let program = link(&parse_sources(&vm_files)?, None)?;
        execute(program, &RunOpts::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hackx-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn keys_accept_codes_names_and_characters() {
        assert_eq!(parse_key("128"), Ok(128));
        assert_eq!(parse_key("Enter"), Ok(128));
        assert_eq!(parse_key("q"), Ok(113));
        assert!(parse_key("Hyper").is_err());
    }

    #[test]
    fn dump_range_syntax() {
        assert_eq!(parse_dump("256:16"), Ok((256, 16)));
        assert!(parse_dump("256").is_err());
        assert!(parse_dump("x:1").is_err());
    }

    #[test]
    fn directories_expand_to_sorted_vm_files() {
        let dir = scratch_dir("expand");
        fs::write(dir.join("Sys.vm"), "").unwrap();
        fs::write(dir.join("Main.vm"), "").unwrap();
        fs::write(dir.join("Main.jack"), "").unwrap();
        let found = expand(&[dir.display().to_string()], "vm").unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["Main.vm", "Sys.vm"]);
        assert!(expand(&[dir.join("Main.jack").display().to_string()], "vm").is_ok());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stage_prefixes_on_errors() {
        let dir = scratch_dir("stages");
        let bad = dir.join("Bad.vm");
        fs::write(&bad, "push nowhere 1\n").unwrap();
        let err = load(&[bad.display().to_string()], None).unwrap_err();
        assert!(err.starts_with("parse: Bad.vm:1:"), "{err}");

        let unlinked = dir.join("Main.vm");
        fs::write(&unlinked, "function Main.main 0\ncall Gone.away 0\nreturn\n").unwrap();
        let err = load(&[unlinked.display().to_string()], None).unwrap_err();
        assert!(err.starts_with("link: call to undefined function Gone.away"), "{err}");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn compile_output_names_stay_inside_out_dir() {
        assert_eq!(output_name("Main.vm"), Ok("Main.vm"));
        assert!(output_name("../Main.vm").is_err());
        assert!(output_name("/etc/x").is_err());
        assert!(output_name("sub/Main.vm").is_err());
        assert!(output_name("..").is_err());
        assert!(output_name("").is_err());

        let dir = scratch_dir("outputs");
        let out = dir.join("out");
        let err = write_outputs(&out, &[("Main.vm", "return\n"), ("../../escape.vm", "x")])
            .unwrap_err();
        assert!(err.starts_with("compile: refusing output name '../../escape.vm'"), "{err}");
        assert!(!out.join("Main.vm").exists());
        assert!(!dir.join("escape.vm").exists());

        let written = write_outputs(&out, &[("Main.vm", "return\n"), ("program.asm", "@0\n")]).unwrap();
        assert_eq!(written, [out.join("Main.vm"), out.join("program.asm")]);
        assert_eq!(fs::read_to_string(out.join("program.asm")).unwrap(), "@0\n");
        let _ = fs::remove_dir_all(&dir);
    }

    fn program(src: &str) -> Program {
        link(&[parse(src, "Main.vm").unwrap()], None).unwrap()
    }

    #[test]
    fn run_reports_halt_and_faults() {
        let ok = program("function Main.main 0\npush constant 2\nreturn\n");
        assert!(execute(ok, &RunOpts::default()).is_ok());

        let bad = program("function Main.main 0\nadd\n");
        let err = execute(bad, &RunOpts::default()).unwrap_err();
        assert!(err.starts_with("runtime: stack underflow"), "{err}");

        let spin = program("function Main.main 0\nlabel L\ngoto L\n");
        let opts = RunOpts { max_steps: 50, ..RunOpts::default() };
        let err = execute(spin, &opts).unwrap_err();
        assert!(err.contains("no halt within 50 steps"), "{err}");
    }

    #[test]
    fn scripted_keys_are_held_one_tick_each() {
        let src = "function Main.main 0\nlabel L\npush constant 24576\npop pointer 1\n\
                   push that 0\npop temp 0\ngoto L\n";
        let mut vm = Vm::new(program(src));
        drive(&mut vm, &[65, 66], 30, 10);
        // Third tick runs with the register released.
        assert_eq!(vm.steps(), 30);
        assert_eq!(vm.keyboard(), 0);
        assert_eq!(vm.status(), &Status::Paused);

        let mut vm = Vm::new(program(src));
        drive(&mut vm, &[65, 66], 20, 10);
        assert_eq!(vm.keyboard(), 66);
        assert_eq!(vm.read(5).unwrap(), 66);
    }
}
