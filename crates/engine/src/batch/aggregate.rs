//! Running aggregates over the rows of one processor scope.

use std::cmp::Ordering;

use anyhow::anyhow;
use batchflow_types::{AggregationFunction, AggregatorDefinition, Value};

use crate::context::ExecutionContext;
use crate::errors::{EngineError, EngineResult};
use crate::expression::Expression;

#[derive(Debug)]
pub(crate) struct Aggregator {
    function: AggregationFunction,
    input_field: Option<String>,
    output_field: String,
    condition: Option<Expression>,
}

/// State of one aggregator since its scope last began.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Accumulator {
    count: i64,
    integer_sum: i64,
    decimal_sum: f64,
    saw_decimal: bool,
    current: Option<Value>,
}

impl Aggregator {
    pub(crate) fn prepare(definition: &AggregatorDefinition, owner: &str) -> EngineResult<Aggregator> {
        let input_field = definition.input_field.clone().filter(|field| !field.trim().is_empty());
        if input_field.is_none() && definition.function != AggregationFunction::Count {
            return Err(EngineError::configuration(format!(
                "aggregator '{}' in {owner} needs an input_field",
                definition.output_field
            )));
        }
        let condition = Expression::parse_optional(definition.condition.as_deref()).map_err(|error| {
            EngineError::configuration(format!("aggregator '{}' in {owner}: {error}", definition.output_field))
        })?;
        Ok(Aggregator {
            function: definition.function,
            input_field,
            output_field: definition.output_field.clone(),
            condition,
        })
    }

    /// Adds the current row to `accumulator` when the condition holds.
    /// Null inputs are ignored.
    pub(crate) fn accumulate(&self, accumulator: &mut Accumulator, context: &ExecutionContext) -> EngineResult<()> {
        if let Some(condition) = &self.condition
            && !condition.is_satisfied(context)?
        {
            return Ok(());
        }
        let value = match &self.input_field {
            Some(field) => context.value_or_null(field),
            None => Value::Boolean(true),
        };
        if value.is_null() {
            return Ok(());
        }
        accumulator.count += 1;

        match self.function {
            AggregationFunction::Count => {}
            AggregationFunction::Sum | AggregationFunction::Average => match value {
                Value::Integer(number) => {
                    match accumulator.integer_sum.checked_add(number) {
                        Some(sum) => accumulator.integer_sum = sum,
                        None if self.function == AggregationFunction::Sum => {
                            return Err(EngineError::Execution(anyhow!(
                                "aggregator '{}' overflowed adding {number}",
                                self.output_field
                            )));
                        }
                        // Averages are taken from the decimal sum.
                        None => {}
                    }
                    accumulator.decimal_sum += number as f64;
                }
                Value::Decimal(number) => {
                    accumulator.saw_decimal = true;
                    accumulator.decimal_sum += number;
                }
                other => {
                    return Err(EngineError::Execution(anyhow!(
                        "aggregator '{}' cannot add non-numeric value '{other}'",
                        self.output_field
                    )));
                }
            },
            AggregationFunction::Min | AggregationFunction::Max => {
                let keep = match &accumulator.current {
                    None => true,
                    Some(current) => {
                        let ordering = value.compare(current).ok_or_else(|| {
                            EngineError::Execution(anyhow!(
                                "aggregator '{}' cannot compare '{value}' with '{current}'",
                                self.output_field
                            ))
                        })?;
                        match self.function {
                            AggregationFunction::Min => ordering == Ordering::Less,
                            _ => ordering == Ordering::Greater,
                        }
                    }
                };
                if keep {
                    accumulator.current = Some(value);
                }
            }
            AggregationFunction::First => {
                if accumulator.current.is_none() {
                    accumulator.current = Some(value);
                }
            }
            AggregationFunction::Last => accumulator.current = Some(value),
        }
        Ok(())
    }

    pub(crate) fn result(&self, accumulator: &Accumulator) -> Value {
        match self.function {
            AggregationFunction::Count => Value::Integer(accumulator.count),
            AggregationFunction::Sum if accumulator.saw_decimal => Value::Decimal(accumulator.decimal_sum),
            AggregationFunction::Sum => Value::Integer(accumulator.integer_sum),
            AggregationFunction::Average if accumulator.count == 0 => Value::Null,
            AggregationFunction::Average => Value::Decimal(accumulator.decimal_sum / accumulator.count as f64),
            AggregationFunction::Min
            | AggregationFunction::Max
            | AggregationFunction::First
            | AggregationFunction::Last => accumulator.current.clone().unwrap_or_default(),
        }
    }

    /// Publishes the accumulated value under the output field.
    pub(crate) fn write(&self, accumulator: &Accumulator, context: &mut ExecutionContext) {
        context.set_value(self.output_field.clone(), self.result(accumulator));
    }
}
