//! Type-erased values and positional argument lists

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::error::{DiError, DiResult};

/// A resolved, type-erased value shared between its consumers
pub type Value = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value
pub fn value<T: Any + Send + Sync>(inner: T) -> Value {
    Arc::new(inner)
}

/// Downcast a value to `Arc<T>`, naming `key` on mismatch
pub fn downcast<T: Any + Send + Sync>(key: &str, value: Value) -> DiResult<Arc<T>> {
    value.downcast::<T>().map_err(|_| DiError::TypeMismatch {
        key: key.to_string(),
        expected: type_name::<T>(),
    })
}

/// Positional arguments injected into a constructor or factory.
///
/// Entries are `None` for optional dependencies that were not bound.
#[derive(Clone, Default)]
pub struct Arguments {
    target: String,
    values: Vec<Option<Value>>,
}

impl Arguments {
    /// Create an argument list for `target`
    pub fn new(target: impl Into<String>, values: Vec<Option<Value>>) -> Self {
        Self {
            target: target.into(),
            values,
        }
    }

    /// Name of the class or binding these arguments are for
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `index`, `None` when absent
    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(Option::as_ref)
    }

    /// Required typed argument
    pub fn get<T: Any + Send + Sync>(&self, index: usize) -> DiResult<Arc<T>> {
        self.optional(index)?.ok_or_else(|| DiError::MissingArgument {
            target: self.target.clone(),
            index,
        })
    }

    /// Optional typed argument; a present value of the wrong type is still an error
    pub fn optional<T: Any + Send + Sync>(&self, index: usize) -> DiResult<Option<Arc<T>>> {
        match self.raw(index) {
            Some(value) => downcast::<T>(&format!("{}[{}]", self.target, index), value.clone())
                .map(Some),
            None => Ok(None),
        }
    }

    /// Clone out a typed argument, for small `Clone` values such as strings
    pub fn cloned<T: Any + Send + Sync + Clone>(&self, index: usize) -> DiResult<T> {
        self.get::<T>(index).map(|arc| (*arc).clone())
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments")
            .field("target", &self.target)
            .field(
                "present",
                &self.values.iter().map(Option::is_some).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let args = Arguments::new(
            "Clock",
            vec![Some(value("UTC".to_string())), None, Some(value(42u32))],
        );

        assert_eq!(args.cloned::<String>(0).unwrap(), "UTC");
        assert!(args.optional::<String>(1).unwrap().is_none());
        assert!(matches!(
            args.get::<String>(1),
            Err(DiError::MissingArgument { index: 1, .. })
        ));
        assert!(matches!(
            args.get::<String>(2),
            Err(DiError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_range_is_absent() {
        let args = Arguments::new("Empty", Vec::new());
        assert!(args.is_empty());
        assert!(args.optional::<u8>(3).unwrap().is_none());
    }
}
