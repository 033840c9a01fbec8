use super::value::Value;

/// A single typed parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

/// How a placeholder in SQL text refers to a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    /// `@name`
    Named(String),
    /// `$n`, 1-based
    Positional(usize),
}

impl ParamRef {
    /// Index into a statement's parameter list, if bound.
    #[must_use]
    pub fn index_in(&self, params: &[Param]) -> Option<usize> {
        match self {
            Self::Named(name) => params.iter().position(|p| p.name.eq_ignore_ascii_case(name)),
            Self::Positional(n) => (*n >= 1 && *n <= params.len()).then(|| n - 1),
        }
    }
}

impl std::fmt::Display for ParamRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => write!(f, "@{name}"),
            Self::Positional(n) => write!(f, "${n}"),
        }
    }
}

/// SQL text plus its ordered parameter bindings. Never mutated once built;
/// rewrites (locking reads) produce new statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push(Param {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Binds `values` as `$1..$n` / `@p1..@pn`.
    #[must_use]
    pub fn with_positional(sql: impl Into<String>, values: Vec<Value>) -> Self {
        let params = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| Param {
                name: format!("p{}", i + 1),
                value,
            })
            .collect();
        Self {
            sql: sql.into(),
            params,
        }
    }

    #[must_use]
    pub fn param(&self, reference: &ParamRef) -> Option<&Value> {
        reference.index_in(&self.params).map(|i| &self.params[i].value)
    }
}
