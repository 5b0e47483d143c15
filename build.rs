use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding crate sources. Anything else under the package root
// (reference material, build output) is not scanned.
const SOURCE_ROOTS: [&str; 7] = ["engine", "hcc", "models", "drivers", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str =
    r"(//|/\*).*\b(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)\b";

#[derive(Clone, Copy)]
enum Filter {
    // Match anywhere outside comments and string literals.
    Code,
    // Match anywhere.
    Any,
    // Comment whose alphabetic characters are all uppercase.
    ShoutingComment,
}

struct Rule {
    name: &'static str,
    pattern: &'static str,
    filter: Filter,
    advice: &'static str,
}

const RULES: [Rule; 4] = [
    Rule {
        name: "underscore-prefixed bindings",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        filter: Filter::Code,
        advice: "Use the binding (dropping the underscore) or remove it.",
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        filter: Filter::Any,
        advice: "Use the code or delete it.",
    },
    Rule {
        name: "change-log comments",
        pattern: FORBIDDEN_WORDS,
        filter: Filter::Any,
        advice: "Comments describe the code as it is, not its history.",
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        filter: Filter::ShoutingComment,
        advice: "Rewrite the comment in sentence case or delete it.",
    },
];

struct Violations {
    filter: Filter,
    lines: Vec<String>,
}

impl Sink for Violations {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        let flagged = match self.filter {
            Filter::Any => true,
            Filter::Code => !is_comment(line) && !inside_string(line),
            Filter::ShoutingComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        };
        if flagged {
            self.lines.push(format!("{line_number}:{line}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*')
}

// An underscore identifier that only shows up between quotes is text, not a binding.
fn inside_string(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .skip(1)
            .step_by(2)
            .any(|quoted| quoted.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let body = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))?;
    Some(body.trim())
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS.into_iter().flat_map(|root| {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn check(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut violations = Violations {
            filter: rule.filter,
            lines: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut violations)?;
        if !violations.lines.is_empty() {
            return Err(report(rule, path, &violations.lines).into());
        }
    }
    Ok(())
}

fn report(rule: &Rule, path: &Path, lines: &[String]) -> String {
    let mut msg = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        lines.len(),
        rule.name,
        path.display()
    );
    for line in lines {
        msg.push_str(&format!("   {line}\n"));
    }
    msg.push_str(&format!("\n⚠️ {} are not allowed in this project.\n", rule.name));
    msg.push_str(&format!("   {}\n", rule.advice));
    msg
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let files: Vec<PathBuf> = source_files().collect();
    for rule in &RULES {
        if let Err(e) = check(rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
