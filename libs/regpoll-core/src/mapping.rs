//! Value mapping
//!
//! A register carries at most one mapping: an enum lookup between raw
//! integers and labels, or a single-variable arithmetic formula whose inverse
//! is derived once when it is compiled. Write validation predicates share the
//! expression parser.

use crate::error::{RegisterError, Result};
use crate::expr::{invert, BinaryOp, Binding, Expr, ExprError, Scope, UnaryOp, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Name of the lookup function available to validation predicates
pub const REGISTER_LOOKUP: &str = "register";

/// Compiled formula with its derived inverse
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    variable: String,
    forward: Expr,
    inverse: Expr,
}

impl Formula {
    pub fn compile(source: &str) -> Result<Self> {
        let forward = Expr::parse(source).map_err(|e| RegisterError::expression(source, e))?;
        let inverse = invert(&forward).map_err(|e| RegisterError::expression(source, e))?;
        let variable = forward
            .variables()
            .into_iter()
            .next()
            .map(str::to_string)
            .ok_or_else(|| RegisterError::expression(source, ExprError::VariableCount(0)))?;

        Ok(Self {
            source: source.to_string(),
            variable,
            forward,
            inverse,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn forward(&self, raw: i64) -> Result<f64> {
        self.apply(&self.forward, raw as f64)
    }

    pub fn inverse(&self, value: f64) -> Result<f64> {
        self.apply(&self.inverse, value)
    }

    fn apply(&self, expr: &Expr, value: f64) -> Result<f64> {
        let scope = Binding {
            name: &self.variable,
            value,
        };
        expr.evaluate(&scope)
            .and_then(|v| v.as_number())
            .map_err(|e| RegisterError::expression(&self.source, e))
    }
}

/// Injective lookup between raw keys and labels
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnumMap {
    labels: BTreeMap<i64, String>,
    keys: HashMap<String, i64>,
}

impl EnumMap {
    /// Build from `(key, label)` pairs. A label used twice is ambiguous.
    pub fn new<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let mut map = Self::default();
        for (key, label) in entries {
            let label = label.into();
            if let Some(previous) = map.keys.insert(label.clone(), key) {
                return Err(RegisterError::config(format!(
                    "Ambiguous enum mapping: label '{label}' used for both {previous} and {key}"
                )));
            }
            if map.labels.insert(key, label.clone()).is_some() {
                return Err(RegisterError::config(format!(
                    "Ambiguous enum mapping: key {key} listed twice"
                )));
            }
        }
        Ok(map)
    }

    pub fn label(&self, key: i64) -> Option<&str> {
        self.labels.get(&key).map(String::as_str)
    }

    pub fn key(&self, label: &str) -> Option<i64> {
        self.keys.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mapping {
    Enum(EnumMap),
    Formula(Formula),
}

/// Write validation predicate.
///
/// `variable` names the proposed value inside `expression`; other registers
/// are reached with `register("name")`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    variable: String,
    source: String,
    expr: Expr,
    lookups: BTreeSet<String>,
}

impl Predicate {
    pub fn compile(variable: &str, expression: &str) -> Result<Self> {
        let config_err = |e: ExprError| RegisterError::expression(expression, e);
        let expr = Expr::parse(expression).map_err(config_err)?;

        if !yields_bool(&expr) {
            return Err(config_err(ExprError::Type(
                "validation must evaluate to a boolean".to_string(),
            )));
        }

        let lookups = references(&expr, Some(variable)).map_err(config_err)?;

        Ok(Self {
            variable: variable.to_string(),
            source: expression.to_string(),
            expr,
            lookups,
        })
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Register names this predicate reads through `register(..)`
    pub fn lookups(&self) -> impl Iterator<Item = &str> {
        self.lookups.iter().map(String::as_str)
    }

    /// Evaluate for a proposed value of `register`
    pub fn evaluate(
        &self,
        register: &str,
        value: f64,
        known: &HashMap<String, f64>,
    ) -> Result<bool> {
        if let Some(missing) = self.lookups.iter().find(|name| !known.contains_key(*name)) {
            return Err(RegisterError::validation(
                register,
                format!("no value for register '{missing}' referenced by validation"),
            ));
        }

        let scope = LookupScope {
            variable: Some(&self.variable),
            value,
            known,
        };
        self.expr
            .evaluate(&scope)
            .and_then(|v| v.as_bool())
            .map_err(|e| RegisterError::validation(register, e.to_string()))
    }
}

/// Numeric expression over `register("name")` lookups and an optional input.
///
/// Backs derived values (no input) and actuator targets (one input).
#[derive(Debug, Clone, PartialEq)]
pub struct Calculation {
    variable: Option<String>,
    source: String,
    expr: Expr,
    lookups: BTreeSet<String>,
}

impl Calculation {
    pub fn compile(variable: Option<&str>, expression: &str) -> Result<Self> {
        let config_err = |e: ExprError| RegisterError::expression(expression, e);
        let expr = Expr::parse(expression).map_err(config_err)?;
        if yields_bool(&expr) {
            return Err(config_err(ExprError::Type(
                "expression must evaluate to a number".to_string(),
            )));
        }
        let lookups = references(&expr, variable).map_err(config_err)?;

        Ok(Self {
            variable: variable.map(str::to_string),
            source: expression.to_string(),
            expr,
            lookups,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn lookups(&self) -> impl Iterator<Item = &str> {
        self.lookups.iter().map(String::as_str)
    }

    /// Evaluate with `input` bound to the variable, if there is one
    pub fn evaluate(&self, input: f64, known: &HashMap<String, f64>) -> Result<f64> {
        let scope = LookupScope {
            variable: self.variable.as_deref(),
            value: input,
            known,
        };
        self.expr
            .evaluate(&scope)
            .and_then(|v| v.as_number())
            .map_err(|e| RegisterError::expression(&self.source, e))
    }
}

/// Collect `register(..)` lookups, rejecting other calls and identifiers
fn references(expr: &Expr, variable: Option<&str>) -> std::result::Result<BTreeSet<String>, ExprError> {
    let mut lookups = BTreeSet::new();
    let mut problem = None;
    expr.visit(&mut |node| match node {
        Expr::Call(name, args) if name == REGISTER_LOOKUP => match args.as_slice() {
            [Expr::Text(register)] => {
                lookups.insert(register.clone());
            },
            _ => {
                problem.get_or_insert(ExprError::Type(format!(
                    "{REGISTER_LOOKUP}() takes one quoted register name"
                )));
            },
        },
        Expr::Call(name, _) => {
            problem.get_or_insert(ExprError::UnknownFunction(name.clone()));
        },
        Expr::Variable(name) if Some(name.as_str()) != variable => {
            problem.get_or_insert(ExprError::UnknownVariable(name.clone()));
        },
        _ => {},
    });
    match problem {
        Some(error) => Err(error),
        None => Ok(lookups),
    }
}

struct LookupScope<'a> {
    variable: Option<&'a str>,
    value: f64,
    known: &'a HashMap<String, f64>,
}

impl Scope for LookupScope<'_> {
    fn variable(&self, name: &str) -> Option<f64> {
        (Some(name) == self.variable).then_some(self.value)
    }

    fn call(&self, name: &str, args: &[Value]) -> std::result::Result<Value, ExprError> {
        match (name, args) {
            (REGISTER_LOOKUP, [Value::Text(register)]) => self
                .known
                .get(register)
                .copied()
                .map(Value::Number)
                .ok_or_else(|| ExprError::UnknownVariable(register.clone())),
            _ => Err(ExprError::UnknownFunction(name.to_string())),
        }
    }
}

fn yields_bool(expr: &Expr) -> bool {
    match expr {
        Expr::Bool(_) | Expr::Unary(UnaryOp::Not, _) => true,
        Expr::Binary(op, _, _) => matches!(
            op,
            BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::And
                | BinaryOp::Or
        ),
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_formula_forward_and_inverse() {
        let formula = Formula::compile("x / 10").unwrap();
        assert_eq!(formula.forward(235).unwrap(), 23.5);
        assert!((formula.inverse(23.5).unwrap() - 235.0).abs() < 1e-9);
    }

    #[test]
    fn test_formula_rejects_non_invertible() {
        let err = Formula::compile("x * y").unwrap_err();
        assert!(err.is_config());

        let err = Formula::compile("x > 2").unwrap_err();
        assert!(err.is_config());

        let err = Formula::compile("12").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_enum_both_directions() {
        let map = EnumMap::new([(0, "OFF"), (1, "ON")]).unwrap();
        assert_eq!(map.label(1), Some("ON"));
        assert_eq!(map.key("OFF"), Some(0));
        assert_eq!(map.label(7), None);
        assert_eq!(map.key("STANDBY"), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_enum_ambiguous_label() {
        let err = EnumMap::new([(0, "OFF"), (2, "OFF")]).unwrap_err();
        assert!(matches!(err, RegisterError::Config(_)));
    }

    #[test]
    fn test_predicate_with_lookup() {
        let predicate =
            Predicate::compile("power", "power >= 0 && power <= register('max_power')").unwrap();
        assert_eq!(predicate.lookups().collect::<Vec<_>>(), vec!["max_power"]);

        let known = HashMap::from([("max_power".to_string(), 5000.0)]);
        assert!(predicate.evaluate("setpoint", 1200.0, &known).unwrap());
        assert!(!predicate.evaluate("setpoint", 6000.0, &known).unwrap());
    }

    #[test]
    fn test_predicate_missing_lookup_is_validation_error() {
        let predicate = Predicate::compile("v", "v < register(\"limit\")").unwrap();
        let err = predicate.evaluate("setpoint", 1.0, &HashMap::new()).unwrap_err();
        assert!(matches!(err, RegisterError::Validation { .. }));
    }

    #[test]
    fn test_predicate_compile_errors() {
        // arithmetic result
        assert!(Predicate::compile("v", "v + 1").unwrap_err().is_config());
        // unknown function
        assert!(Predicate::compile("v", "abs(v) < 3").unwrap_err().is_config());
        // lookup argument must be a literal name
        assert!(Predicate::compile("v", "v < register(v)")
            .unwrap_err()
            .is_config());
        // stray identifier
        assert!(Predicate::compile("v", "w < 3").unwrap_err().is_config());
    }

    #[test]
    fn test_predicate_negation() {
        let predicate = Predicate::compile("mode", "!(mode == 3)").unwrap();
        assert!(predicate.evaluate("mode", 1.0, &HashMap::new()).unwrap());
        assert!(!predicate.evaluate("mode", 3.0, &HashMap::new()).unwrap());
    }

    // ========== calculations ==========

    #[test]
    fn test_calculation_over_lookups() {
        let calc = Calculation::compile(None, "register('energy') / 1000 + register('offset')").unwrap();
        assert_eq!(calc.lookups().collect::<Vec<_>>(), vec!["energy", "offset"]);

        let known = HashMap::from([
            ("energy".to_string(), 2500.0),
            ("offset".to_string(), 1.0),
        ]);
        assert_eq!(calc.evaluate(0.0, &known).unwrap(), 3.5);
        assert!(calc.evaluate(0.0, &HashMap::new()).unwrap_err().is_config());
    }

    #[test]
    fn test_calculation_with_input() {
        let calc = Calculation::compile(Some("value"), "value * 10").unwrap();
        assert_eq!(calc.evaluate(2.5, &HashMap::new()).unwrap(), 25.0);

        // constants ignore the input
        let calc = Calculation::compile(Some("value"), "2").unwrap();
        assert_eq!(calc.evaluate(7.0, &HashMap::new()).unwrap(), 2.0);
    }

    #[test]
    fn test_calculation_compile_errors() {
        assert!(Calculation::compile(None, "x + 1").unwrap_err().is_config());
        assert!(Calculation::compile(Some("value"), "other * 2").unwrap_err().is_config());
        assert!(Calculation::compile(None, "register('a') > 1").unwrap_err().is_config());
        assert!(Calculation::compile(None, "sqrt(register('a'))").unwrap_err().is_config());
    }
}
