//! Task arguments: a named value map where each value is either set or
//! delayed. Delayed values are closures resolved when the task's `start`
//! call is accepted; until then the argument counts as present for the
//! fully-instantiated check only if the model provides no stricter policy.

use std::{collections::BTreeMap, rc::Rc};

use serde_json::Value;

use crate::{
    errors::PlanError,
    ident::{Digest, ObjectId},
    internal::{plan::Plan, task::model::TaskModel},
};

/// A delayed argument value, resolved against the plan at start time.
pub type DelayedArgument = Rc<dyn Fn(&Plan, ObjectId) -> Result<Value, PlanError>>;

#[derive(Clone)]
pub enum ArgumentValue {
    Set(Value),
    Delayed(DelayedArgument),
}

impl std::fmt::Debug for ArgumentValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgumentValue::Set(value) => write!(f, "Set({value})"),
            ArgumentValue::Delayed(_) => write!(f, "Delayed"),
        }
    }
}

/// The argument set of one task instance.
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    values: BTreeMap<String, ArgumentValue>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an argument to a concrete value.
    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), ArgumentValue::Set(value));
    }

    /// Set an argument to a delayed placeholder.
    pub fn set_delayed(&mut self, name: &str, resolver: DelayedArgument) {
        self.values
            .insert(name.to_string(), ArgumentValue::Delayed(resolver));
    }

    /// The concrete value of an argument; `None` when unset or still
    /// delayed.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(ArgumentValue::Set(value)) => Some(value),
            _ => None,
        }
    }

    /// Is the argument either set or delayed?
    pub fn is_present(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Names and resolvers of the still-delayed arguments.
    pub(crate) fn delayed_entries(&self) -> Vec<(String, DelayedArgument)> {
        self.values
            .iter()
            .filter_map(|(name, value)| match value {
                ArgumentValue::Delayed(resolver) => Some((name.clone(), resolver.clone())),
                ArgumentValue::Set(_) => None,
            })
            .collect()
    }

    /// Fill in model defaults for declared-but-absent arguments.
    pub(crate) fn merge_defaults(&mut self, model: &TaskModel) {
        for argument in model.arguments() {
            if !self.values.contains_key(&argument.name)
                && let Some(default) = &argument.default
            {
                self.set(&argument.name, default.clone());
            }
        }
    }

    /// A task is fully instantiated iff every declared argument is set,
    /// delayed, or defaulted.
    pub fn fully_instantiated(&self, model: &TaskModel) -> bool {
        model.arguments().iter().all(|argument| {
            !argument.required
                || argument.default.is_some()
                || self.values.contains_key(&argument.name)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgumentValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Content digest of the concrete argument values, written to
    /// task-added log records. Delayed values digest as a fixed marker.
    pub fn digest(&self) -> Digest {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.values {
            let encoded = match value {
                ArgumentValue::Set(v) => v.clone(),
                ArgumentValue::Delayed(_) => Value::String("<delayed>".to_string()),
            };
            map.insert(name.clone(), encoded);
        }
        Digest::of_value(&Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use serde_json::json;

    use super::Arguments;
    use crate::internal::task::model::TaskModel;

    /// Required arguments without defaults gate full instantiation.
    #[test]
    fn test_fully_instantiated() {
        let model = TaskModel::new("MoveTo")
            .with_argument("goal", true, None)
            .with_argument("speed", true, Some(json!(0.5)));
        let mut arguments = Arguments::new();
        assert!(!arguments.fully_instantiated(&model));
        arguments.set("goal", json!([10, 20]));
        assert!(arguments.fully_instantiated(&model));
    }

    /// Defaults only fill declared-but-absent names.
    #[test]
    fn test_merge_defaults() {
        let model = TaskModel::new("MoveTo").with_argument("speed", true, Some(json!(0.5)));
        let mut arguments = Arguments::new();
        arguments.set("goal", json!([1, 2]));
        arguments.merge_defaults(&model);
        assert_eq!(arguments.get("speed"), Some(&json!(0.5)));
        assert_eq!(arguments.get("goal"), Some(&json!([1, 2])));
    }

    /// A delayed argument is present but has no concrete value yet.
    #[test]
    fn test_delayed_argument() {
        let mut arguments = Arguments::new();
        arguments.set_delayed("target", Rc::new(|_, _| Ok(json!(42))));
        assert!(arguments.is_present("target"));
        assert!(arguments.get("target").is_none());
        assert_eq!(arguments.delayed_entries().len(), 1);
    }

    /// Argument digests are order-independent and distinguish values.
    #[test]
    fn test_argument_digest() {
        let mut a = Arguments::new();
        a.set("x", json!(1));
        a.set("y", json!(2));
        let mut b = Arguments::new();
        b.set("y", json!(2));
        b.set("x", json!(1));
        assert_eq!(a.digest(), b.digest());
        b.set("x", json!(3));
        assert_ne!(a.digest(), b.digest());
    }
}
