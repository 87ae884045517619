//! Migration steps.

use crate::backend::Engine;

/// An ordered list of statements with optional per-engine replacements.
#[derive(Debug, Clone, Default)]
pub struct Statements {
    default: Vec<String>,
    overrides: Vec<(Engine, Vec<String>)>,
}

impl Statements {
    fn push(&mut self, sql: impl Into<String>) {
        self.default.push(sql.into());
    }

    fn push_for(&mut self, engine: Engine, sql: impl Into<String>) {
        match self.overrides.iter_mut().find(|(e, _)| *e == engine) {
            Some((_, stmts)) => stmts.push(sql.into()),
            None => self.overrides.push((engine, vec![sql.into()])),
        }
    }

    /// Statements to run on `engine`.
    ///
    /// An engine with overrides runs only its overrides.
    pub fn for_engine(&self, engine: Engine) -> &[String] {
        self.overrides
            .iter()
            .find(|(e, _)| *e == engine)
            .map(|(_, stmts)| stmts.as_slice())
            .unwrap_or(&self.default)
    }

    /// Whether no statement is registered for any engine.
    pub fn is_empty(&self) -> bool {
        self.default.is_empty() && self.overrides.is_empty()
    }
}

/// One numbered, reversible schema change.
#[derive(Debug, Clone)]
pub struct Migration {
    version: i64,
    description: String,
    up: Statements,
    down: Statements,
}

impl Migration {
    /// Create an empty step.
    pub fn new(version: i64, description: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            up: Statements::default(),
            down: Statements::default(),
        }
    }

    /// Append a forward statement.
    pub fn up(mut self, sql: impl Into<String>) -> Self {
        self.up.push(sql);
        self
    }

    /// Append a reverse statement.
    pub fn down(mut self, sql: impl Into<String>) -> Self {
        self.down.push(sql);
        self
    }

    /// Append a forward statement used only on `engine`.
    pub fn up_for(mut self, engine: Engine, sql: impl Into<String>) -> Self {
        self.up.push_for(engine, sql);
        self
    }

    /// Append a reverse statement used only on `engine`.
    pub fn down_for(mut self, engine: Engine, sql: impl Into<String>) -> Self {
        self.down.push_for(engine, sql);
        self
    }

    /// Ordering key.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Forward statements for `engine`.
    pub fn up_statements(&self, engine: Engine) -> &[String] {
        self.up.for_engine(engine)
    }

    /// Reverse statements for `engine`.
    pub fn down_statements(&self, engine: Engine) -> &[String] {
        self.down.for_engine(engine)
    }
}
