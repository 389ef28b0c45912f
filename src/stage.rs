//! Pipeline stages.
//!
//! A stage consumes one input at a time and pushes zero or more outputs into
//! the caller's buffer. Outputs pushed before an error are kept, so a stage
//! that fails halfway through a batch still delivers what it produced. Stages
//! own all of their state, so chaining never shares mutable state between
//! them. Record-level stages (`map`, `filter`, `field_map`) are built
//! here; converters supply the byte-level stages.

use std::fmt;

use crate::error::StreamError;
use crate::record::{apply_field_mapping, Record};

// ─────────────────────────────────────────────────────────────────────────────
// Transform
// ─────────────────────────────────────────────────────────────────────────────

/// A single-input, single-output pipeline stage.
pub trait Transform {
    /// Items accepted by `write`.
    type Input;
    /// Items produced by `write` and `end`.
    type Output;

    /// Processes one input, appending the outputs it produces to `out`, in
    /// order. On error, outputs already appended are still valid and precede
    /// the error.
    fn write(&mut self, input: Self::Input, out: &mut Vec<Self::Output>) -> Result<(), StreamError>;

    /// Signals end of input, appending any outputs still held by the stage.
    fn end(&mut self, _out: &mut Vec<Self::Output>) -> Result<(), StreamError> {
        Ok(())
    }

    /// The display name of this stage, used in errors and logs.
    fn name(&self) -> &str;

    /// Attaches `next` downstream of this stage, presenting both as one stage.
    fn pipe<N>(self, next: N) -> Composite<Self, N>
    where
        Self: Sized,
        N: Transform<Input = Self::Output>,
    {
        Composite::new(self, next)
    }
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    type Input = T::Input;
    type Output = T::Output;

    fn write(&mut self, input: Self::Input, out: &mut Vec<Self::Output>) -> Result<(), StreamError> {
        (**self).write(input, out)
    }

    fn end(&mut self, out: &mut Vec<Self::Output>) -> Result<(), StreamError> {
        (**self).end(out)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Composite
// ─────────────────────────────────────────────────────────────────────────────

/// Two stages wired back to back and exposed as one.
///
/// Writes go to the first stage; every output of the first stage is written
/// to the second. `pipe` on a composite attaches after the second stage.
pub struct Composite<A, B> {
    first: A,
    second: B,
    name: String,
}

impl<A, B> Composite<A, B>
where
    A: Transform,
    B: Transform<Input = A::Output>,
{
    /// Wires `first` into `second`.
    pub fn new(first: A, second: B) -> Self {
        let name = format!("{}|{}", first.name(), second.name());
        Self {
            first,
            second,
            name,
        }
    }

    fn forward(&mut self, items: Vec<A::Output>, out: &mut Vec<B::Output>) -> Result<(), StreamError> {
        for item in items {
            self.second.write(item, out)?;
        }
        Ok(())
    }
}

impl<A, B> Transform for Composite<A, B>
where
    A: Transform,
    B: Transform<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn write(&mut self, input: Self::Input, out: &mut Vec<Self::Output>) -> Result<(), StreamError> {
        let mut intermediate = Vec::new();
        let written = self.first.write(input, &mut intermediate);
        self.forward(intermediate, out)?;
        written
    }

    fn end(&mut self, out: &mut Vec<Self::Output>) -> Result<(), StreamError> {
        let mut remaining = Vec::new();
        let flushed = self.first.end(&mut remaining);
        self.forward(remaining, out)?;
        flushed?;
        self.second.end(out)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<A, B> fmt::Debug for Composite<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composite").field("name", &self.name).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Map
// ─────────────────────────────────────────────────────────────────────────────

/// Emits `f(record)` when it returns a record, otherwise the original.
pub struct MapStage<F> {
    f: F,
}

impl<F> Transform for MapStage<F>
where
    F: FnMut(&Record) -> Option<Record>,
{
    type Input = Record;
    type Output = Record;

    fn write(&mut self, record: Record, out: &mut Vec<Record>) -> Result<(), StreamError> {
        out.push((self.f)(&record).unwrap_or(record));
        Ok(())
    }

    fn name(&self) -> &str {
        "map"
    }
}

/// Fallible `MapStage`. An error halts the pipeline.
pub struct TryMapStage<F> {
    f: F,
}

impl<F> Transform for TryMapStage<F>
where
    F: FnMut(&Record) -> Result<Option<Record>, StreamError>,
{
    type Input = Record;
    type Output = Record;

    fn write(&mut self, record: Record, out: &mut Vec<Record>) -> Result<(), StreamError> {
        let mapped = (self.f)(&record)?;
        out.push(mapped.unwrap_or(record));
        Ok(())
    }

    fn name(&self) -> &str {
        "map"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter
// ─────────────────────────────────────────────────────────────────────────────

/// Emits a record unchanged only if the predicate holds.
pub struct FilterStage<F> {
    f: F,
}

impl<F> Transform for FilterStage<F>
where
    F: FnMut(&Record) -> bool,
{
    type Input = Record;
    type Output = Record;

    fn write(&mut self, record: Record, out: &mut Vec<Record>) -> Result<(), StreamError> {
        if (self.f)(&record) {
            out.push(record);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "filter"
    }
}

/// Fallible `FilterStage`. An error halts the pipeline.
pub struct TryFilterStage<F> {
    f: F,
}

impl<F> Transform for TryFilterStage<F>
where
    F: FnMut(&Record) -> Result<bool, StreamError>,
{
    type Input = Record;
    type Output = Record;

    fn write(&mut self, record: Record, out: &mut Vec<Record>) -> Result<(), StreamError> {
        if (self.f)(&record)? {
            out.push(record);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "filter"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Field map
// ─────────────────────────────────────────────────────────────────────────────

/// Rebuilds every record from a mapping template.
///
/// Each output holds the source `Id` plus every template field, evaluated
/// against the source record unless `raw` is set.
#[derive(Debug, Clone)]
pub struct FieldMapStage {
    template: Record,
    raw: bool,
}

impl FieldMapStage {
    pub fn new(template: Record, raw: bool) -> Self {
        Self { template, raw }
    }
}

impl Transform for FieldMapStage {
    type Input = Record;
    type Output = Record;

    fn write(&mut self, record: Record, out: &mut Vec<Record>) -> Result<(), StreamError> {
        out.push(apply_field_mapping(&self.template, &record, self.raw));
        Ok(())
    }

    fn name(&self) -> &str {
        "field_map"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builders
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a detached map stage.
pub fn map<F>(f: F) -> MapStage<F>
where
    F: FnMut(&Record) -> Option<Record>,
{
    MapStage { f }
}

/// Builds a detached fallible map stage.
pub fn try_map<F>(f: F) -> TryMapStage<F>
where
    F: FnMut(&Record) -> Result<Option<Record>, StreamError>,
{
    TryMapStage { f }
}

/// Builds a detached filter stage.
pub fn filter<F>(f: F) -> FilterStage<F>
where
    F: FnMut(&Record) -> bool,
{
    FilterStage { f }
}

/// Builds a detached fallible filter stage.
pub fn try_filter<F>(f: F) -> TryFilterStage<F>
where
    F: FnMut(&Record) -> Result<bool, StreamError>,
{
    TryFilterStage { f }
}

/// Builds a detached templated field-map stage.
pub fn field_map(template: Record, raw: bool) -> FieldMapStage {
    FieldMapStage::new(template, raw)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn rec(value: Value) -> Record {
        crate::record::record_from_value(value).expect("object")
    }

    fn written<T: Transform>(stage: &mut T, input: T::Input) -> Result<Vec<T::Output>, StreamError> {
        let mut out = Vec::new();
        stage.write(input, &mut out)?;
        Ok(out)
    }

    fn ended<T: Transform>(stage: &mut T) -> Result<Vec<T::Output>, StreamError> {
        let mut out = Vec::new();
        stage.end(&mut out)?;
        Ok(out)
    }

    /// Stage that repeats every input `n` times and emits a marker on end.
    struct Repeat {
        n: usize,
    }

    impl Transform for Repeat {
        type Input = Record;
        type Output = Record;

        fn write(&mut self, record: Record, out: &mut Vec<Record>) -> Result<(), StreamError> {
            out.extend(std::iter::repeat(record).take(self.n));
            Ok(())
        }

        fn end(&mut self, out: &mut Vec<Record>) -> Result<(), StreamError> {
            out.push(rec(json!({ "end": true })));
            Ok(())
        }

        fn name(&self) -> &str {
            "repeat"
        }
    }

    /// Stage that splits a record into one record per field and fails on the
    /// field named `bad`.
    struct SplitFields;

    impl Transform for SplitFields {
        type Input = Record;
        type Output = Record;

        fn write(&mut self, record: Record, out: &mut Vec<Record>) -> Result<(), StreamError> {
            for (key, value) in record {
                if key == "bad" {
                    return Err(StreamError::stage("split", "bad field"));
                }
                let mut single = Record::new();
                single.insert(key, value);
                out.push(single);
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "split"
        }
    }

    #[test]
    fn map_none_re_emits_original() {
        let mut stage = map(|_| None);
        let input = rec(json!({ "Id": "1" }));
        assert_eq!(written(&mut stage, input.clone()).unwrap(), vec![input]);
    }

    #[test]
    fn map_some_emits_replacement() {
        let mut stage = map(|_| Some(rec(json!({ "Id": "2" }))));
        let out = written(&mut stage, rec(json!({ "Id": "1" }))).unwrap();
        assert_eq!(out, vec![rec(json!({ "Id": "2" }))]);
    }

    #[test]
    fn try_map_error_propagates() {
        let mut stage = try_map(|_| Err(StreamError::stage("map", "bad record")));
        let err = written(&mut stage, rec(json!({}))).unwrap_err();
        assert!(matches!(err, StreamError::StageFailed { .. }));
    }

    #[test]
    fn filter_drops_false() {
        let mut stage = filter(|r| r.get("keep") == Some(&json!(true)));
        assert_eq!(written(&mut stage, rec(json!({ "keep": true }))).unwrap().len(), 1);
        assert!(written(&mut stage, rec(json!({ "keep": false }))).unwrap().is_empty());
        assert!(written(&mut stage, rec(json!({}))).unwrap().is_empty());
    }

    #[test]
    fn try_filter_error_propagates() {
        let mut stage = try_filter(|_| Err(StreamError::stage("filter", "nope")));
        assert!(written(&mut stage, rec(json!({}))).is_err());
    }

    #[test]
    fn field_map_stage_builds_from_template() {
        let mut stage = field_map(rec(json!({ "Label": "${Name}!" })), false);
        let out = written(&mut stage, rec(json!({ "Id": "001", "Name": "Acme" }))).unwrap();
        assert_eq!(out, vec![rec(json!({ "Id": "001", "Label": "Acme!" }))]);
    }

    #[test]
    fn composite_writes_into_first_stage() {
        let first = map(|r| {
            let mut r2 = r.clone();
            r2.insert("mapped".into(), json!(true));
            Some(r2)
        });
        let mut composite = first.pipe(Repeat { n: 2 });

        let out = written(&mut composite, rec(json!({ "Id": "1" }))).unwrap();

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r["mapped"] == json!(true)));
    }

    #[test]
    fn composite_end_flushes_both_stages_in_order() {
        let mut composite = Repeat { n: 1 }.pipe(Repeat { n: 1 });

        let out = ended(&mut composite).unwrap();

        // first stage's end marker passes through the second, then the second's own marker
        assert_eq!(out, vec![rec(json!({ "end": true })), rec(json!({ "end": true }))]);
    }

    #[test]
    fn composite_pipe_attaches_after_last_stage() {
        let composite = map(|_| None).pipe(filter(|r| r.contains_key("Id")));
        let mut chained = composite.pipe(Repeat { n: 3 });

        assert_eq!(chained.name(), "map|filter|repeat");
        assert_eq!(written(&mut chained, rec(json!({ "Id": "1" }))).unwrap().len(), 3);
        assert!(written(&mut chained, rec(json!({}))).unwrap().is_empty());
    }

    #[test]
    fn outputs_before_an_error_are_kept() {
        let mut stage = SplitFields;
        let mut out = Vec::new();

        let result = stage.write(rec(json!({ "a": 1, "b": 2, "bad": 3, "c": 4 })), &mut out);

        assert!(matches!(result, Err(StreamError::StageFailed { .. })));
        assert_eq!(out, vec![rec(json!({ "a": 1 })), rec(json!({ "b": 2 }))]);
    }

    #[test]
    fn composite_forwards_partial_output_before_error() {
        let mut composite = SplitFields.pipe(Repeat { n: 2 });
        let mut out = Vec::new();

        let result = composite.write(rec(json!({ "a": 1, "bad": 0 })), &mut out);

        assert!(result.is_err());
        assert_eq!(out, vec![rec(json!({ "a": 1 })), rec(json!({ "a": 1 }))]);
    }

    #[test]
    fn boxed_stage_delegates() {
        let mut boxed: Box<dyn Transform<Input = Record, Output = Record>> = Box::new(Repeat { n: 2 });
        assert_eq!(boxed.name(), "repeat");
        assert_eq!(written(&mut boxed, rec(json!({}))).unwrap().len(), 2);
    }
}
