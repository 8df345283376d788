use crate::{
    error::{Error, Result},
    io::KeyValue,
    mergefn::{retract_unsupported, MergeFunction},
    options::CoreOptions,
    row::{Datum, Row, RowKind},
    schema::TableSchema,
};

/// Named per-field aggregators of the `aggregation` merge engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Sum,
    Min,
    Max,
    LastValue,
    LastNonNullValue,
    ListAgg,
    BoolAnd,
    BoolOr,
}

impl Aggregator {
    fn parse(name: &str, field: &str) -> Result<Self> {
        match name {
            "sum" => Ok(Aggregator::Sum),
            "min" => Ok(Aggregator::Min),
            "max" => Ok(Aggregator::Max),
            "last_value" => Ok(Aggregator::LastValue),
            "last_non_null_value" => Ok(Aggregator::LastNonNullValue),
            "listagg" => Ok(Aggregator::ListAgg),
            "bool_and" => Ok(Aggregator::BoolAnd),
            "bool_or" => Ok(Aggregator::BoolOr),
            other => Err(Error::ConfigInvalid(format!(
                "unknown value '{other}' for 'fields.{field}.aggregate-function'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    /// None for key fields, which pass through untouched.
    aggregator: Option<Aggregator>,
    ignore_retract: bool,
}

/// Aggregation plan for every value field, resolved from table options.
#[derive(Debug, Clone)]
pub struct AggregateFields {
    specs: Vec<FieldSpec>,
}

impl AggregateFields {
    pub fn from_options(schema: &TableSchema, options: &CoreOptions) -> Result<Self> {
        let mut specs = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            if schema.primary_keys.contains(&field.name) {
                specs.push(FieldSpec {
                    aggregator: None,
                    ignore_retract: false,
                });
                continue;
            }
            let aggregator = match options.field_aggregates.get(&field.name) {
                Some(name) => Aggregator::parse(name, &field.name)?,
                None => Aggregator::LastNonNullValue,
            };
            specs.push(FieldSpec {
                aggregator: Some(aggregator),
                ignore_retract: options
                    .field_ignore_retract
                    .get(&field.name)
                    .copied()
                    .unwrap_or(false),
            });
        }
        Ok(AggregateFields { specs })
    }

    pub fn create(&self) -> Aggregate {
        Aggregate {
            specs: self.specs.clone(),
            current: None,
        }
    }
}

/// Applies one [`Aggregator`] per value field across the records of a key.
pub struct Aggregate {
    specs: Vec<FieldSpec>,
    current: Option<KeyValue>,
}

impl MergeFunction for Aggregate {
    fn reset(&mut self) {
        self.current = None;
    }

    fn add(&mut self, kv: KeyValue) -> Result<()> {
        let retract = kv.kind.is_retract();
        match &mut self.current {
            None if !retract => self.current = Some(kv),
            None => {
                // retraction into empty state: only sum can represent it
                let mut fields: Vec<Datum> = Vec::with_capacity(kv.value.len());
                for (spec, datum) in self.specs.iter().zip(kv.value.fields()) {
                    fields.push(apply_retract_to_empty(spec, datum)?);
                }
                self.current = Some(KeyValue::new(kv.key, kv.sequence, RowKind::Insert, Row::new(fields)));
            }
            Some(current) => {
                let mut fields = current.value.fields().to_vec();
                for (i, (spec, datum)) in self.specs.iter().zip(kv.value.fields()).enumerate() {
                    fields[i] = if retract {
                        retract_field(spec, &fields[i], datum)?
                    } else {
                        merge_field(spec, &fields[i], datum)?
                    };
                }
                current.value = Row::new(fields);
                current.sequence = kv.sequence;
            }
        }
        Ok(())
    }

    fn result(&mut self) -> Result<Option<KeyValue>> {
        Ok(self.current.take().map(|mut kv| {
            kv.kind = RowKind::Insert;
            kv
        }))
    }
}

fn merge_field(spec: &FieldSpec, accumulated: &Datum, incoming: &Datum) -> Result<Datum> {
    let Some(aggregator) = spec.aggregator else {
        // key field: values are identical by construction
        return Ok(incoming.clone());
    };
    let merged = match aggregator {
        Aggregator::Sum => sum(accumulated, incoming, 1)?,
        Aggregator::Min => {
            if incoming.is_null() {
                accumulated.clone()
            } else if accumulated.is_null() {
                incoming.clone()
            } else {
                accumulated.clone().min(incoming.clone())
            }
        }
        Aggregator::Max => {
            if incoming.is_null() {
                accumulated.clone()
            } else {
                accumulated.clone().max(incoming.clone())
            }
        }
        Aggregator::LastValue => incoming.clone(),
        Aggregator::LastNonNullValue => {
            if incoming.is_null() {
                accumulated.clone()
            } else {
                incoming.clone()
            }
        }
        Aggregator::ListAgg => match (accumulated, incoming) {
            (_, Datum::Null) => accumulated.clone(),
            (Datum::Null, Datum::String(s)) => Datum::String(s.clone()),
            (Datum::String(a), Datum::String(b)) => Datum::String(format!("{a},{b}")),
            (a, b) => {
                return Err(Error::MergeUnsupported(format!(
                    "listagg expects STRING values, found {a:?} and {b:?}"
                )))
            }
        },
        Aggregator::BoolAnd => bool_combine(accumulated, incoming, |a, b| a && b)?,
        Aggregator::BoolOr => bool_combine(accumulated, incoming, |a, b| a || b)?,
    };
    Ok(merged)
}

fn retract_field(spec: &FieldSpec, accumulated: &Datum, incoming: &Datum) -> Result<Datum> {
    match spec.aggregator {
        None => Ok(accumulated.clone()),
        Some(Aggregator::Sum) => sum(accumulated, incoming, -1),
        Some(aggregator) => {
            if spec.ignore_retract {
                Ok(accumulated.clone())
            } else {
                Err(retract_unsupported(&format!("aggregate function {aggregator:?}")))
            }
        }
    }
}

fn apply_retract_to_empty(spec: &FieldSpec, incoming: &Datum) -> Result<Datum> {
    match spec.aggregator {
        None => Ok(incoming.clone()),
        Some(Aggregator::Sum) => sum(&Datum::Null, incoming, -1),
        Some(aggregator) => {
            if spec.ignore_retract {
                Ok(Datum::Null)
            } else {
                Err(retract_unsupported(&format!("aggregate function {aggregator:?}")))
            }
        }
    }
}

fn sum(accumulated: &Datum, incoming: &Datum, sign: i64) -> Result<Datum> {
    let result = match (accumulated, incoming) {
        (a, Datum::Null) => a.clone(),
        (Datum::Null, Datum::Int(b)) => Datum::Int(*b * sign as i32),
        (Datum::Null, Datum::BigInt(b)) => Datum::BigInt(*b * sign),
        (Datum::Null, Datum::Double(b)) => Datum::Double(*b * sign as f64),
        (Datum::Int(a), Datum::Int(b)) => Datum::Int(a + b * sign as i32),
        (Datum::BigInt(a), Datum::BigInt(b)) => Datum::BigInt(a + b * sign),
        (Datum::Double(a), Datum::Double(b)) => Datum::Double(a + b * sign as f64),
        (a, b) => {
            return Err(Error::MergeUnsupported(format!(
                "sum cannot combine {a:?} with {b:?}"
            )))
        }
    };
    Ok(result)
}

fn bool_combine(
    accumulated: &Datum,
    incoming: &Datum,
    combine: impl Fn(bool, bool) -> bool,
) -> Result<Datum> {
    let result = match (accumulated, incoming) {
        (a, Datum::Null) => a.clone(),
        (Datum::Null, Datum::Boolean(b)) => Datum::Boolean(*b),
        (Datum::Boolean(a), Datum::Boolean(b)) => Datum::Boolean(combine(*a, *b)),
        (a, b) => {
            return Err(Error::MergeUnsupported(format!(
                "boolean aggregate cannot combine {a:?} with {b:?}"
            )))
        }
    };
    Ok(result)
}
