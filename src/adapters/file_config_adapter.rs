//! INI file configuration adapter.

use crate::domain::error::QueryError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, QueryError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config.load(path).map_err(|reason| QueryError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, QueryError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| QueryError::ConfigParse {
                file: "<string>".to_string(),
                reason,
            })?;
        Ok(Self { config })
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }

    fn get_int(&self, section: &str, key: &str) -> Result<Option<i64>, String> {
        self.config.getint(section, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn from_string_parses_config() {
        let content = r#"
[engine]
delimiter = |
join_size_threshold = 5000

[crypto]
password = correct horse
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(
            adapter.get_string("engine", "delimiter"),
            Some("|".to_string())
        );
        assert_eq!(
            adapter.get_string("crypto", "password"),
            Some("correct horse".to_string())
        );
        assert_eq!(adapter.get_int("engine", "join_size_threshold"), Ok(Some(5000)));
    }

    #[test]
    fn sections_and_keys_are_case_insensitive() {
        let adapter = FileConfigAdapter::from_string("[Engine]\nSample_Rows = 20\n").unwrap();
        assert_eq!(adapter.get_int("engine", "sample_rows"), Ok(Some(20)));
    }

    #[test]
    fn get_string_returns_none_for_missing_key() {
        let adapter = FileConfigAdapter::from_string("[engine]\nsample_rows = 100\n").unwrap();
        assert_eq!(adapter.get_string("engine", "missing"), None);
        assert_eq!(adapter.get_string("missing_section", "key"), None);
    }

    #[test]
    fn get_int_distinguishes_missing_from_invalid() {
        let adapter = FileConfigAdapter::from_string("[engine]\nsample_rows = abc\n").unwrap();
        assert_eq!(adapter.get_int("engine", "missing"), Ok(None));
        assert!(adapter.get_int("engine", "sample_rows").is_err());
    }

    #[test]
    fn from_file_reads_config() {
        let file = create_temp_config("[logging]\nlevel = debug\n");
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(
            adapter.get_string("logging", "level"),
            Some("debug".to_string())
        );
    }

    #[test]
    fn from_file_returns_error_for_missing_file() {
        let result = FileConfigAdapter::from_file("/nonexistent/path/config.ini");
        assert!(matches!(result, Err(QueryError::ConfigParse { .. })));
    }
}
