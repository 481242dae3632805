// src/handler/registry.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::PythonSection;
use crate::config::SearchSection;
use crate::handler::TypeHandler;
use crate::handler::python::PythonHandler;
use crate::types::TaskType;

/// Lookup table from task type to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TypeHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("types", &types)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Python handler serving both `python` and `numpy`.
    pub fn with_python(python: &PythonSection, search: &SearchSection) -> Self {
        let mut registry = Self::new();
        registry.register(
            TaskType::Python,
            Arc::new(PythonHandler::new(
                python.venv_cmd.clone(),
                python.base_packages.clone(),
                search.clone(),
            )),
        );
        registry.register(
            TaskType::Numpy,
            Arc::new(PythonHandler::new(
                python.venv_cmd.clone(),
                python.numpy_packages.clone(),
                search.clone(),
            )),
        );
        registry
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TypeHandler>) {
        self.handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TypeHandler>> {
        self.handlers.get(&task_type).cloned()
    }
}
