//! Path-level differences between two json values, used to explain in the logs why a
//! function is being re-rendered.
use serde_json::Value;

use std::fmt::{self, Display, Write};

type JsonObject = serde_json::Map<String, Value>;

static NULL: Value = Value::Null;

#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    pub path: String,
    pub previous: &'a Value,
    pub desired: &'a Value,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "'{}': {} -> {}",
            self.path, self.previous, self.desired
        )
    }
}

pub struct Diffs<'a>(Vec<Diff<'a>>);

impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.path.as_str()).collect()
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            f.write_str("<empty>")
        } else {
            write!(f, "{} differences: ", self.0.len())?;
            for (i, diff) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                Display::fmt(diff, f)?;
            }
            Ok(())
        }
    }
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Compares two values in both directions. A field that only exists on one side shows up
/// with `null` on the other, and arrays are compared index by index.
pub fn compare_values<'a>(previous: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut diffs = Vec::new();
    let mut path = Vec::with_capacity(8);
    compare(&mut diffs, &mut path, previous, desired);
    Diffs(diffs)
}

fn compare<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    previous: &'a Value,
    desired: &'a Value,
) {
    match (previous, desired) {
        (Value::Object(ref previous), Value::Object(ref desired)) => {
            compare_objects(diffs, path, previous, desired);
        }
        (Value::Array(ref previous), Value::Array(ref desired)) => {
            compare_arrays(diffs, path, previous, desired);
        }
        (a, b) if a != b => {
            diffs.push(diff(&*path, a, b));
        }
        _ => {}
    }
}

fn compare_objects<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    previous: &'a JsonObject,
    desired: &'a JsonObject,
) {
    for (key, desired_val) in desired.iter() {
        path.push(Segment::Key(key));
        compare(diffs, path, previous.get(key).unwrap_or(&NULL), desired_val);
        path.pop();
    }
    for (key, previous_val) in previous.iter().filter(|(k, _)| !desired.contains_key(*k)) {
        path.push(Segment::Key(key));
        diffs.push(diff(&*path, previous_val, &NULL));
        path.pop();
    }
}

fn compare_arrays<'a>(
    diffs: &mut Vec<Diff<'a>>,
    path: &mut Vec<Segment<'a>>,
    previous: &'a [Value],
    desired: &'a [Value],
) {
    for i in 0..previous.len().max(desired.len()) {
        path.push(Segment::Index(i));
        compare(
            diffs,
            path,
            previous.get(i).unwrap_or(&NULL),
            desired.get(i).unwrap_or(&NULL),
        );
        path.pop();
    }
}

fn diff<'a>(path: &[Segment], previous: &'a Value, desired: &'a Value) -> Diff<'a> {
    let mut p = String::with_capacity(8);
    for s in path.iter() {
        p.push('.');
        match s {
            Segment::Key(ref k) => p.push_str(k),
            Segment::Index(i) => {
                let _ = write!(p, "{}", i);
            }
        }
    }
    Diff {
        path: p,
        previous,
        desired,
    }
}
