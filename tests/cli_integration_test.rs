//! CLI integration tests.
//!
//! Tests cover:
//! - Config loading and flag overrides (build_engine_config, load_config)
//! - Single queries on stdout, batches from stdin
//! - Saving results, including numbered batch files
//! - The describe subcommand
//! - Exit codes for parse, schema and config failures

mod common;

use common::*;
use csvquery::adapters::file_config_adapter::FileConfigAdapter;
use csvquery::cli;
use csvquery::domain::error::QueryError;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn csvquery(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_csvquery"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

fn csvquery_with_stdin(args: &[&str], input: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_csvquery"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

const VALID_INI: &str = r#"
[engine]
delimiter = ,
join_size_threshold = 1000
sample_rows = 100
progress_interval_ms = 0

[crypto]
password = from-config

[logging]
level = error
"#;

mod config_loading {
    use super::*;

    #[test]
    fn valid_ini_builds_engine_config() {
        let adapter = FileConfigAdapter::from_string(VALID_INI).unwrap();
        let config = cli::build_engine_config(Some(&adapter), None, None).unwrap();
        assert_eq!(config.delimiter, b',');
        assert_eq!(config.join_size_threshold, 1000);
        assert_eq!(config.sample_rows, 100);
        assert!(config.progress_interval.is_zero());
        assert_eq!(config.password.as_deref(), Some("from-config"));
    }

    #[test]
    fn flags_take_precedence() {
        let adapter = FileConfigAdapter::from_string(VALID_INI).unwrap();
        let config = cli::build_engine_config(Some(&adapter), Some("|"), Some("flag")).unwrap();
        assert_eq!(config.delimiter, b'|');
        assert_eq!(config.password.as_deref(), Some("flag"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let adapter =
            FileConfigAdapter::from_string("[engine]\njoin_size_threshold = -1\n").unwrap();
        let err = cli::build_engine_config(Some(&adapter), None, None).unwrap_err();
        assert!(matches!(err, QueryError::ConfigInvalid { .. }));
    }

    #[test]
    fn load_config_from_disk() {
        let ini = write_temp_ini(VALID_INI);
        assert!(cli::load_config(&ini.path().to_path_buf()).is_ok());
        assert!(cli::load_config(&PathBuf::from("/nonexistent/csvquery.ini")).is_err());
    }
}

mod queries {
    use super::*;

    #[test]
    fn single_query_prints_csv() {
        let f = Fixtures::standard();
        let query = format!("select id, region from {} limit 2", f.file("sales.csv"));
        let output = csvquery(&["-c", &query]);
        assert!(output.status.success());
        assert_eq!(stdout(&output), "id,region\n1,A\n2,B\n");
    }

    #[test]
    fn delimiter_flag_applies_to_input_and_output() {
        let f = Fixtures::new();
        f.write("pairs.tsv", "a\tb\n1\t2\n");
        let query = format!("select b, a from {}", f.file("pairs.tsv"));
        let output = csvquery(&["-c", &query, "-d", "tab"]);
        assert!(output.status.success());
        assert_eq!(stdout(&output), "b\ta\n2\t1\n");
    }

    #[test]
    fn batch_from_stdin_runs_every_statement() {
        let f = Fixtures::standard();
        let batch = format!(
            "select code from {r} where code = 'A';\nselect label from {r} where code = 'B';",
            r = f.file("regions.csv")
        );
        let output = csvquery_with_stdin(&[], &batch);
        assert!(output.status.success());
        assert_eq!(stdout(&output), "code\nA\n\nlabel\nSouth\n");
    }

    #[test]
    fn batch_continues_after_a_failure() {
        let f = Fixtures::standard();
        let batch = format!(
            "select nothing from;\nselect code from {} limit 1",
            f.file("regions.csv")
        );
        let output = csvquery_with_stdin(&[], &batch);
        assert_eq!(output.status.code(), Some(4));
        assert!(stdout(&output).contains("code\nA\n"));
    }

    #[test]
    fn save_writes_file() {
        let f = Fixtures::standard();
        let target = f.dir.path().join("out.csv");
        let query = format!("select label from {}", f.file("regions.csv"));
        let output = csvquery(&["-c", &query, "--save", target.to_str().unwrap()]);
        assert!(output.status.success());
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "label\nNorth\nSouth\n"
        );
    }

    #[test]
    fn batch_save_numbers_each_file() {
        let f = Fixtures::standard();
        let target = f.dir.path().join("out.csv");
        let batch = format!(
            "select code from {r}; select label from {r}",
            r = f.file("regions.csv")
        );
        let mut child = Command::new(env!("CARGO_BIN_EXE_csvquery"))
            .args(["--save", target.to_str().unwrap()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        child
            .stdin
            .take()
            .unwrap()
            .write_all(batch.as_bytes())
            .unwrap();
        assert!(child.wait().unwrap().success());

        let first = std::fs::read_to_string(f.dir.path().join("out-1.csv")).unwrap();
        let second = std::fs::read_to_string(f.dir.path().join("out-2.csv")).unwrap();
        assert_eq!(first, "code\nA\nB\n");
        assert_eq!(second, "label\nNorth\nSouth\n");
    }

    #[test]
    fn config_password_reaches_encrypt() {
        let f = Fixtures::standard();
        let ini = write_temp_ini(VALID_INI);
        let query = format!(
            "select decrypt(encrypt(label)) from {} limit 1",
            f.file("regions.csv")
        );
        let output = csvquery(&["-c", &query, "--config", ini.path().to_str().unwrap()]);
        assert!(output.status.success());
        assert!(stdout(&output).ends_with("North\n"));
    }
}

mod failures {
    use super::*;

    #[test]
    fn parse_error_exits_4_with_caret() {
        let output = csvquery(&["-c", "select a"]);
        assert_eq!(output.status.code(), Some(4));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains('^'));
    }

    #[test]
    fn missing_file_exits_3() {
        let f = Fixtures::new();
        let query = format!("select * from {}", f.file("absent.csv"));
        let output = csvquery(&["-c", &query]);
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn bad_config_exits_2() {
        let ini = write_temp_ini("[engine]\nsample_rows = zero\n");
        let output = csvquery(&["-c", "select 1", "--config", ini.path().to_str().unwrap()]);
        assert_eq!(output.status.code(), Some(2));
    }

    #[test]
    fn bad_delimiter_flag_exits_2() {
        let output = csvquery(&["-c", "select 1", "-d", "ab"]);
        assert_eq!(output.status.code(), Some(2));
    }
}

mod describe {
    use super::*;

    #[test]
    fn describe_lists_columns_and_rows() {
        let f = Fixtures::standard();
        let path = f.dir.path().join("sales.csv");
        let output = csvquery(&["describe", path.to_str().unwrap()]);
        assert!(output.status.success());
        let text = stdout(&output);
        assert!(text.contains("region"));
        assert!(text.contains("5 rows"));
        assert_eq!(text.lines().count(), 1 + 5 + 1);
    }
}
