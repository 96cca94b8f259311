use grep::matcher::Matcher;
use grep::regex::RegexMatcher;
use grep::searcher::sinks::UTF8;
use grep::searcher::Searcher;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Library sources must propagate errors and log through `log`.
const LIBRARY_ROOTS: [&str; 4] = ["fit", "latent", "linalg", "random"];
const HARNESS_ROOTS: [&str; 3] = ["cli", "tests", "benches"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    // Every scanned file, test modules included.
    Everywhere,
    // Library files only, up to their `#[cfg(test)]` module.
    LibraryCode,
}

struct Rule {
    name: &'static str,
    pattern: &'static str,
    scope: Scope,
    advice: &'static str,
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed binding",
        pattern: r"\b_[a-zA-Z0-9_]+\b",
        scope: Scope::Everywhere,
        advice: "Use the binding without the underscore or remove it.",
    },
    Rule {
        name: "lint suppression",
        pattern: r"#!?\s*\[\s*allow\s*\(\s*(dead_code|unused\w*)",
        scope: Scope::Everywhere,
        advice: "Delete the unused item instead of silencing the lint.",
    },
    Rule {
        name: "edit-marker comment",
        pattern: r"//.*\b(FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGE|MODIFIED|UPDATED|UPDATE)\b",
        scope: Scope::Everywhere,
        advice: "Comments describe the code, not its history.",
    },
    Rule {
        name: "panicking unwrap",
        pattern: r"\.(unwrap|expect)\(",
        scope: Scope::LibraryCode,
        advice: "Return a FitError, LinalgError or GigError with `?` instead.",
    },
    Rule {
        name: "direct console output",
        pattern: r"\b(println|eprintln|dbg)!",
        scope: Scope::LibraryCode,
        advice: "Report through the `log` macros; only the CLI writes to the console.",
    },
];

struct SourceFile {
    path: PathBuf,
    library: bool,
}

fn source_files() -> Vec<SourceFile> {
    let walk = |roots: &[&str], library: bool| -> Vec<SourceFile> {
        roots
            .iter()
            .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| SourceFile {
                path: e.path().to_path_buf(),
                library,
            })
            .collect()
    };
    let mut files = walk(&LIBRARY_ROOTS, true);
    files.extend(walk(&HARNESS_ROOTS, false));
    files.push(SourceFile {
        path: PathBuf::from("build.rs"),
        library: false,
    });
    files
}

/// Line number of the first `#[cfg(test)]`, past which library rules stop applying.
fn test_module_start(path: &Path) -> Result<u64, Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    let line = text
        .lines()
        .position(|line| line.trim_start().starts_with("#[cfg(test)]"))
        .map_or(u64::MAX, |idx| idx as u64 + 1);
    Ok(line)
}

/// Drops string literal contents so that quoted text never matches a rule.
fn code_portion(line: &str) -> String {
    line.split('"')
        .enumerate()
        .filter(|(idx, _)| idx % 2 == 0)
        .map(|(_, part)| part)
        .collect::<Vec<_>>()
        .join("\"\"")
}

fn check(rule: &Rule, file: &SourceFile, searcher: &mut Searcher) -> Result<Vec<String>, Box<dyn Error>> {
    if rule.scope == Scope::LibraryCode && !file.library {
        return Ok(Vec::new());
    }
    let cutoff = match rule.scope {
        Scope::LibraryCode => test_module_start(&file.path)?,
        Scope::Everywhere => u64::MAX,
    };
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let comment_rule = rule.name == "edit-marker comment";

    let mut hits = Vec::new();
    searcher.search_path(
        &matcher,
        &file.path,
        UTF8(|line_number, line| {
            if line_number >= cutoff {
                return Ok(false);
            }
            let trimmed = line.trim_end();
            let is_comment = trimmed.trim_start().starts_with("//");
            let relevant = if comment_rule {
                is_comment
            } else {
                !is_comment && matcher.is_match(code_portion(trimmed).as_bytes()).unwrap_or(false)
            };
            if relevant {
                hits.push(format!("   {}:{line_number}: {}", file.path.display(), trimmed.trim_start()));
            }
            Ok(true)
        }),
    )?;
    Ok(hits)
}

fn run_policy() -> Result<(), Box<dyn Error>> {
    let files = source_files();
    let mut searcher = Searcher::new();
    let mut report = String::new();
    for rule in &RULES {
        let mut hits = Vec::new();
        for file in &files {
            hits.extend(check(rule, file, &mut searcher)?);
        }
        if !hits.is_empty() {
            report.push_str(&format!("\n❌ {} ({} found):\n", rule.name, hits.len()));
            for hit in hits {
                report.push_str(&hit);
                report.push('\n');
            }
            report.push_str(&format!("   {}\n", rule.advice));
        }
    }
    if report.is_empty() {
        Ok(())
    } else {
        Err(report.into())
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in LIBRARY_ROOTS.iter().chain(HARNESS_ROOTS.iter()) {
        println!("cargo:rerun-if-changed={root}");
    }

    if let Err(e) = run_policy() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
