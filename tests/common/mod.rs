#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use csvquery::domain::engine::{Engine, EngineConfig, QueryResult};
use csvquery::domain::value::Value;
use tempfile::TempDir;

pub const SALES: &str = "\
id,region,amount,price,sold
1,A,1,2.5,2024-01-05
2,B,2,1.0,2024-01-06
3,A,2,4.0,2024-02-10
4,B,3,0.5,2024-02-11
5,C,,3.0,2024-03-01
";

pub const REGIONS: &str = "\
code,label
A,North
B,South
";

/// Temporary directory holding the CSV fixtures a test writes into it.
pub struct Fixtures {
    pub dir: TempDir,
}

impl Fixtures {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Standard sales and regions files.
    pub fn standard() -> Self {
        let fixtures = Self::new();
        fixtures.write("sales.csv", SALES);
        fixtures.write("regions.csv", REGIONS);
        fixtures
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// Quoted path of `name` for use inside a query.
    pub fn file(&self, name: &str) -> String {
        format!("'{}'", self.dir.path().join(name).display())
    }
}

pub fn run(query: &str) -> QueryResult {
    Engine::new(EngineConfig::default())
        .query(query)
        .unwrap_or_else(|e| panic!("query failed: {e}\n{query}"))
}

/// Every row rendered as display strings.
pub fn cells(result: &QueryResult) -> Vec<Vec<String>> {
    result
        .rows
        .iter()
        .map(|row| row.iter().map(Value::to_string).collect())
        .collect()
}

/// One column rendered as display strings.
pub fn column(result: &QueryResult, index: usize) -> Vec<String> {
    result.rows.iter().map(|row| row[index].to_string()).collect()
}
