//! Change-detection map: one last-emitted value per data-point identifier.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::output::Output;
use crate::types::Value;

/// Owned by the processor worker; every write happens on that task.
pub struct DataPointStore {
    values: HashMap<String, Value>,
    output: Arc<dyn Output>,
}

impl DataPointStore {
    pub fn new(output: Arc<dyn Output>) -> Self {
        Self {
            values: HashMap::new(),
            output,
        }
    }

    /// Store and emit `value` unless it equals the current entry. `None`
    /// (a skipped transform chain) touches nothing.
    pub fn set(&mut self, id: &str, value: Option<Value>) -> Result<()> {
        let Some(value) = value else {
            return Ok(());
        };
        match self.values.get(id) {
            Some(current) if *current == value => Ok(()),
            _ => {
                self.values.insert(id.to_string(), value.clone());
                self.output.emit(id, &value)
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Result;

    #[derive(Default)]
    struct RecordingOutput {
        lines: Mutex<Vec<String>>,
    }

    impl Output for RecordingOutput {
        fn emit(&self, id: &str, value: &Value) -> Result<()> {
            self.lines.lock().unwrap().push(format!("{id} {value}"));
            Ok(())
        }

        fn beacon(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn emits_only_on_change() {
        let out = Arc::new(RecordingOutput::default());
        let mut store = DataPointStore::new(out.clone());

        store.set("s.a", Some(Value::Int(1))).unwrap();
        store.set("s.a", Some(Value::Int(1))).unwrap();
        store.set("s.a", Some(Value::Int(2))).unwrap();
        store.set("s.a", None).unwrap();
        store.set("s.a", Some(Value::Int(2))).unwrap();

        assert_eq!(*out.lines.lock().unwrap(), vec!["s.a 1", "s.a 2"]);
    }

    #[test]
    fn representation_change_does_not_reemit() {
        let out = Arc::new(RecordingOutput::default());
        let mut store = DataPointStore::new(out.clone());

        store.set("s.a", Some(Value::Int(100))).unwrap();
        store.set("s.a", Some(Value::Float(100.0))).unwrap();

        assert_eq!(out.lines.lock().unwrap().len(), 1);
    }
}
