//! Condition expressions used by step preconditions, loop `while` clauses and
//! aggregator filters.
//!
//! Supported syntax: `||`, `&&`, prefix `!`, the comparisons `==`, `!=`, `<`,
//! `<=`, `>`, `>=`, parentheses, quoted text (`'a'` or `"a"`), numbers,
//! `true`, `false`, `null` and bare field names. A leading `!` applies to the
//! whole comparison that follows it (`!a == b` reads as `!(a == b)`).
//!
//! Expressions are parsed once when a step is prepared. Evaluation reads
//! field values from the [`ExecutionContext`]; unset fields are `null`.

use std::cmp::Ordering;

use batchflow_types::{Value, ValueType};
use thiserror::Error;

use crate::context::ExecutionContext;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("invalid expression '{expression}': {reason}")]
    Syntax { expression: String, reason: String },
    #[error("cannot compare {left} with {right} in '{expression}'")]
    TypeMismatch {
        expression: String,
        left: String,
        right: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl ComparisonOperator {
    /// Operators in search order; two-character forms come first so `<=` is
    /// never read as `<`.
    const SEARCH_ORDER: [(&'static str, ComparisonOperator); 6] = [
        ("==", ComparisonOperator::Equal),
        ("!=", ComparisonOperator::NotEqual),
        ("<=", ComparisonOperator::LessOrEqual),
        (">=", ComparisonOperator::GreaterOrEqual),
        ("<", ComparisonOperator::Less),
        (">", ComparisonOperator::Greater),
    ];

    fn symbol(self) -> &'static str {
        match self {
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
            ComparisonOperator::Less => "<",
            ComparisonOperator::LessOrEqual => "<=",
            ComparisonOperator::Greater => ">",
            ComparisonOperator::GreaterOrEqual => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Field(String),
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Vec<Node>),
    Compare {
        left: Box<Node>,
        operator: ComparisonOperator,
        right: Box<Node>,
    },
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Expression, ExpressionError> {
        let trimmed = source.trim();
        let root = parse_node(trimmed).map_err(|reason| ExpressionError::Syntax {
            expression: trimmed.to_string(),
            reason,
        })?;
        Ok(Expression {
            source: trimmed.to_string(),
            root,
        })
    }

    /// Parses an optional expression, treating blank text as absent.
    pub fn parse_optional(source: Option<&str>) -> Result<Option<Expression>, ExpressionError> {
        match source.map(str::trim) {
            Some(text) if !text.is_empty() => Expression::parse(text).map(Some),
            _ => Ok(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field names read by this expression.
    pub fn fields(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_fields(&self.root, &mut names);
        names
    }

    pub fn evaluate(&self, context: &ExecutionContext) -> Result<Value, ExpressionError> {
        self.evaluate_node(&self.root, context)
    }

    /// Evaluates and interprets the result as a boolean.
    pub fn is_satisfied(&self, context: &ExecutionContext) -> Result<bool, ExpressionError> {
        Ok(self.evaluate(context)?.is_truthy())
    }

    fn evaluate_node(&self, node: &Node, context: &ExecutionContext) -> Result<Value, ExpressionError> {
        match node {
            Node::Literal(value) => Ok(value.clone()),
            Node::Field(name) => Ok(context.value_or_null(name)),
            Node::Not(inner) => Ok(Value::Boolean(!self.evaluate_node(inner, context)?.is_truthy())),
            Node::And(parts) => {
                for part in parts {
                    if !self.evaluate_node(part, context)?.is_truthy() {
                        return Ok(Value::Boolean(false));
                    }
                }
                Ok(Value::Boolean(true))
            }
            Node::Or(parts) => {
                for part in parts {
                    if self.evaluate_node(part, context)?.is_truthy() {
                        return Ok(Value::Boolean(true));
                    }
                }
                Ok(Value::Boolean(false))
            }
            Node::Compare { left, operator, right } => {
                let left = self.evaluate_node(left, context)?;
                let right = self.evaluate_node(right, context)?;
                self.compare(&left, *operator, &right).map(Value::Boolean)
            }
        }
    }

    fn compare(&self, left: &Value, operator: ComparisonOperator, right: &Value) -> Result<bool, ExpressionError> {
        if left.is_null() || right.is_null() {
            let both_null = left.is_null() && right.is_null();
            return Ok(match operator {
                ComparisonOperator::Equal => both_null,
                ComparisonOperator::NotEqual => !both_null,
                _ => false,
            });
        }
        let ordering = compare_values(left, right).ok_or_else(|| ExpressionError::TypeMismatch {
            expression: self.source.clone(),
            left: describe(left),
            right: describe(right),
        })?;
        Ok(match operator {
            ComparisonOperator::Equal => ordering == Ordering::Equal,
            ComparisonOperator::NotEqual => ordering != Ordering::Equal,
            ComparisonOperator::Less => ordering == Ordering::Less,
            ComparisonOperator::LessOrEqual => ordering != Ordering::Greater,
            ComparisonOperator::Greater => ordering == Ordering::Greater,
            ComparisonOperator::GreaterOrEqual => ordering != Ordering::Less,
        })
    }
}

/// Dates compare against ISO text so `due < '2024-01-01'` works on date fields.
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Date(_), Value::Text(text)) => left.compare(&Value::parse(text, ValueType::Date).ok()?),
        (Value::Text(text), Value::Date(_)) => Value::parse(text, ValueType::Date).ok()?.compare(right),
        _ => left.compare(right),
    }
}

fn describe(value: &Value) -> String {
    match value.value_type() {
        Some(value_type) => format!("{value_type} '{value}'"),
        None => "null".to_string(),
    }
}

fn collect_fields<'a>(node: &'a Node, names: &mut Vec<&'a str>) {
    match node {
        Node::Literal(_) => {}
        Node::Field(name) => {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        Node::Not(inner) => collect_fields(inner, names),
        Node::And(parts) | Node::Or(parts) => parts.iter().for_each(|part| collect_fields(part, names)),
        Node::Compare { left, right, .. } => {
            collect_fields(left, names);
            collect_fields(right, names);
        }
    }
}

fn parse_node(expression: &str) -> Result<Node, String> {
    if expression.is_empty() {
        return Err("expression cannot be empty".into());
    }
    check_balance(expression)?;

    if let Some(parts) = split_expression(expression, "||") {
        return parts.into_iter().map(parse_node).collect::<Result<_, _>>().map(Node::Or);
    }
    if let Some(parts) = split_expression(expression, "&&") {
        return parts.into_iter().map(parse_node).collect::<Result<_, _>>().map(Node::And);
    }

    let (negations, inner) = strip_leading_negations(expression);
    if negations > 0 {
        if inner.is_empty() {
            return Err("expression cannot end with negation operator".into());
        }
        let mut node = parse_node(inner)?;
        for _ in 0..negations {
            node = Node::Not(Box::new(node));
        }
        return Ok(node);
    }

    for (symbol, operator) in ComparisonOperator::SEARCH_ORDER {
        if let Some(position) = find_top_level_operator(expression, symbol) {
            let left = expression[..position].trim();
            let right = expression[position + symbol.len()..].trim();
            if left.is_empty() || right.is_empty() {
                return Err(format!("'{}' needs an operand on both sides", operator.symbol()));
            }
            return Ok(Node::Compare {
                left: Box::new(parse_node(left)?),
                operator,
                right: Box::new(parse_node(right)?),
            });
        }
    }

    if let Some(inner) = strip_enclosing_parentheses(expression) {
        return parse_node(inner.trim());
    }

    parse_operand(expression)
}

fn parse_operand(expression: &str) -> Result<Node, String> {
    if let Some(text) = strip_quotes(expression) {
        return Ok(Node::Literal(Value::Text(text.to_string())));
    }
    match expression {
        "true" => return Ok(Node::Literal(Value::Boolean(true))),
        "false" => return Ok(Node::Literal(Value::Boolean(false))),
        "null" => return Ok(Node::Literal(Value::Null)),
        _ => {}
    }
    if let Ok(number) = expression.parse::<i64>() {
        return Ok(Node::Literal(Value::Integer(number)));
    }
    let starts_like_number = expression
        .chars()
        .next()
        .map(|character| character == '-' || character.is_ascii_digit())
        .unwrap_or(false);
    if starts_like_number {
        return expression
            .parse::<f64>()
            .map(|number| Node::Literal(Value::Decimal(number)))
            .map_err(|_| format!("'{expression}' is not a number"));
    }
    if expression.chars().all(is_identifier_character) {
        return Ok(Node::Field(expression.to_string()));
    }
    Err(format!("unsupported operand '{expression}'"))
}

fn is_identifier_character(character: char) -> bool {
    character.is_alphanumeric() || matches!(character, '_' | '.' | '-')
}

fn strip_quotes(expression: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        if expression.len() >= 2 && expression.starts_with(quote) && expression.ends_with(quote) {
            let inner = &expression[1..expression.len() - 1];
            if !inner.contains(quote) {
                return Some(inner);
            }
        }
    }
    None
}

fn strip_enclosing_parentheses(expression: &str) -> Option<&str> {
    let inner = expression.strip_prefix('(')?.strip_suffix(')')?;
    // `(a) == (b)` never reaches here; comparisons are split first.
    let mut depth = 0i32;
    for character in inner.chars() {
        match character {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    Some(inner)
}

fn check_balance(expression: &str) -> Result<(), String> {
    let mut depth = 0i32;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    for character in expression.chars() {
        match character {
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            '(' if !in_single_quote && !in_double_quote => depth += 1,
            ')' if !in_single_quote && !in_double_quote => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced ')'".into());
                }
            }
            _ => {}
        }
    }
    if in_single_quote || in_double_quote {
        return Err("unterminated quoted text".into());
    }
    if depth != 0 {
        return Err("unbalanced '('".into());
    }
    Ok(())
}

fn split_expression<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut rest = expression;
    while let Some(index) = find_top_level_operator(rest, operator) {
        parts.push(rest[..index].trim());
        rest = &rest[index + operator.len()..];
    }
    if parts.is_empty() {
        return None;
    }
    parts.push(rest.trim());
    Some(parts)
}

fn strip_leading_negations(expression: &str) -> (usize, &str) {
    let mut count = 0usize;
    let mut remainder = expression.trim_start();
    while let Some(stripped) = remainder.strip_prefix('!') {
        if stripped.starts_with('=') {
            break;
        }
        count += 1;
        remainder = stripped.trim_start();
    }
    (count, remainder)
}

fn find_top_level_operator(expression: &str, operator: &str) -> Option<usize> {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut depth = 0i32;

    for (index, character) in expression.char_indices() {
        match character {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                continue;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                continue;
            }
            '(' if !in_single_quote && !in_double_quote => {
                depth += 1;
                continue;
            }
            ')' if !in_single_quote && !in_double_quote => {
                if depth > 0 {
                    depth -= 1;
                }
                continue;
            }
            _ => {}
        }

        if !in_single_quote && !in_double_quote && depth == 0 && expression[index..].starts_with(operator) {
            return Some(index);
        }
    }

    None
}
