use anyhow::{anyhow, bail, Context as _};
use jtl_core::{Lexer, Template};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
enum CliCommand {
    Run {
        file: PathBuf,
        input: Option<String>,
        compact: bool,
    },
    Check {
        files: Vec<PathBuf>,
    },
    Tokens {
        file: PathBuf,
    },
    Compile {
        file: PathBuf,
    },
}

pub fn run_from_env() -> anyhow::Result<()> {
    run_from_args(env::args().skip(1).collect())
}

pub fn run_from_args(args: Vec<String>) -> anyhow::Result<()> {
    let command = parse_command(args).map_err(|msg| anyhow!(msg))?;

    match command {
        CliCommand::Run {
            file,
            input,
            compact,
        } => run_template(file, input, compact),
        CliCommand::Check { files } => check_templates(files),
        CliCommand::Tokens { file } => dump_tokens(file),
        CliCommand::Compile { file } => dump_instructions(file),
    }
}

fn parse_command(args: Vec<String>) -> Result<CliCommand, String> {
    if args.is_empty() {
        return Err(help_text());
    }

    let cmd = args[0].as_str();
    match cmd {
        "run" => parse_run(args),
        "check" => parse_check(args),
        "tokens" => parse_single_file(args, "tokens").map(|file| CliCommand::Tokens { file }),
        "compile" => parse_single_file(args, "compile").map(|file| CliCommand::Compile { file }),
        "help" | "--help" | "-h" => Err(help_text()),
        _ => Err(format!("unknown command: {cmd}\n\n{}", help_text())),
    }
}

fn parse_run(args: Vec<String>) -> Result<CliCommand, String> {
    let mut file: Option<PathBuf> = None;
    let mut input: Option<String> = None;
    let mut compact = false;

    let mut i = 1usize;
    while i < args.len() {
        let token = &args[i];
        match token.as_str() {
            "--input" => {
                i += 1;
                input = Some(
                    args.get(i)
                        .ok_or_else(|| "--input requires a value".to_string())?
                        .to_string(),
                );
            }
            "--compact" => compact = true,
            x if x.starts_with("--") => return Err(format!("unknown flag: {x}")),
            _ => {
                if file.is_some() {
                    return Err("only one FILE positional argument is allowed".to_string());
                }
                file = Some(PathBuf::from(token));
            }
        }
        i += 1;
    }

    let file = file.ok_or_else(|| "run requires FILE".to_string())?;
    Ok(CliCommand::Run {
        file,
        input,
        compact,
    })
}

fn parse_check(args: Vec<String>) -> Result<CliCommand, String> {
    let mut files: Vec<PathBuf> = Vec::new();
    for token in &args[1..] {
        if token.starts_with("--") {
            return Err(format!("unknown flag: {token}"));
        }
        files.push(PathBuf::from(token));
    }
    if files.is_empty() {
        return Err("check requires at least one FILE".to_string());
    }
    Ok(CliCommand::Check { files })
}

fn parse_single_file(args: Vec<String>, name: &str) -> Result<PathBuf, String> {
    let mut file: Option<PathBuf> = None;
    for token in &args[1..] {
        if token.starts_with("--") {
            return Err(format!("unknown flag: {token}"));
        }
        if file.is_some() {
            return Err("only one FILE positional argument is allowed".to_string());
        }
        file = Some(PathBuf::from(token));
    }
    file.ok_or_else(|| format!("{name} requires FILE"))
}

fn help_text() -> String {
    [
        "jtl CLI",
        "",
        "Commands:",
        "  jtl run FILE [--input JSON_OR_PATH] [--compact]",
        "  jtl check FILE...",
        "  jtl tokens FILE",
        "  jtl compile FILE",
    ]
    .join("\n")
}

fn read_template(file: &PathBuf) -> anyhow::Result<Template> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    Template::parse(&source).map_err(|e| anyhow!("{}: {e}", file.display()))
}

/// `--input` takes a JSON literal, or a path to a JSON file when the value
/// does not parse as JSON itself.
fn load_input(input: Option<String>) -> anyhow::Result<Option<serde_json::Value>> {
    let Some(raw) = input else {
        return Ok(None);
    };
    if let Ok(value) = serde_json::from_str(&raw) {
        return Ok(Some(value));
    }
    let text = fs::read_to_string(&raw).with_context(|| format!("failed to read {raw}"))?;
    let value = serde_json::from_str(&text).with_context(|| format!("failed to parse {raw}"))?;
    Ok(Some(value))
}

fn run_template(file: PathBuf, input: Option<String>, compact: bool) -> anyhow::Result<()> {
    let template = read_template(&file)?;
    let output = match load_input(input)? {
        Some(value) => template.evaluate_with(&value),
        None => template.evaluate(),
    }
    .map_err(|e| anyhow!("{}: {e}", file.display()))?;

    let rendered = if compact {
        serde_json::to_string(&output)?
    } else {
        serde_json::to_string_pretty(&output)?
    };
    println!("{rendered}");
    Ok(())
}

fn check_templates(files: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut failures = 0usize;
    for file in &files {
        match read_template(file) {
            Ok(_) => println!("{}: ok", file.display()),
            Err(e) => {
                eprintln!("{e:#}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{failures} of {} templates failed to compile", files.len());
    }
    Ok(())
}

fn dump_tokens(file: PathBuf) -> anyhow::Result<()> {
    let source = fs::read_to_string(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let tokens = Lexer::tokenize(&source).map_err(|e| anyhow!("{}: {e}", file.display()))?;
    for token in tokens {
        match &token.value {
            Some(value) => println!("{}  {:?} {}", token.span, token.ty, value.display_string()),
            None => println!("{}  {:?}", token.span, token.ty),
        }
    }
    Ok(())
}

fn dump_instructions(file: PathBuf) -> anyhow::Result<()> {
    let template = read_template(&file)?;
    print!("{}", template.debug_listing());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_file(prefix: &str, contents: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "{}-{}-{}.jtl",
            prefix,
            std::process::id(),
            ts
        ));
        std::fs::write(&path, contents).expect("failed to write temp template");
        path
    }

    #[test]
    fn test_parse_run_command() {
        let cmd = parse_command(vec![
            "run".into(),
            "t.jtl".into(),
            "--input".into(),
            "{}".into(),
            "--compact".into(),
        ])
        .expect("run command should parse");
        assert_eq!(
            cmd,
            CliCommand::Run {
                file: PathBuf::from("t.jtl"),
                input: Some("{}".into()),
                compact: true,
            }
        );
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = parse_command(vec!["run".into(), "t.jtl".into(), "--nope".into()])
            .expect_err("unknown flag should be rejected");
        assert!(err.contains("unknown flag"));
    }

    #[test]
    fn test_help_lists_commands() {
        let err = parse_command(vec![]).expect_err("no args should print help");
        assert!(err.contains("jtl run"));
        assert!(err.contains("jtl check"));
    }

    #[test]
    fn test_run_template_from_file() {
        let file = unique_temp_file("jtl-run", "{'n': 1 + 2}");
        let result = run_from_args(vec!["run".into(), file.display().to_string()]);
        let _ = std::fs::remove_file(&file);
        result.expect("template should evaluate");
    }

    #[test]
    fn test_check_reports_broken_template() {
        let file = unique_temp_file("jtl-check", "{'a': ");
        let result = run_from_args(vec!["check".into(), file.display().to_string()]);
        let _ = std::fs::remove_file(&file);
        let err = result.expect_err("broken template should fail check");
        assert!(err.to_string().contains("failed to compile"));
    }

    #[test]
    fn test_input_accepts_json_literal() {
        let value = load_input(Some("{\"a\": 1}".into()))
            .expect("literal input should load")
            .expect("input should be present");
        assert_eq!(value, serde_json::json!({"a": 1}));
    }
}
