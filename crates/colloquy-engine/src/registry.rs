use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use colloquy_core::tools::{Tool, ToolDefinition};

/// Which registered tools are offered to the model.
#[derive(Clone, Debug, Default)]
pub enum ToolFilter {
    #[default]
    All,
    Except(HashSet<String>),
    Only(HashSet<String>),
}

impl ToolFilter {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Except(names) => !names.contains(name),
            Self::Only(names) => names.contains(name),
        }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`, replacing any previous tool with the same id.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let _ = self.tools.insert(tool.id().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors sorted by name so requests are stable across runs.
    pub fn definitions(&self, filter: &ToolFilter) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| filter.allows(t.id()))
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::EchoTool;

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Arc::new(EchoTool::named("zeta")));
        r.register(Arc::new(EchoTool::named("alpha")));
        r.register(Arc::new(EchoTool::named("mid")));
        r
    }

    #[test]
    fn definitions_are_sorted() {
        let names: Vec<String> = registry()
            .definitions(&ToolFilter::All)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn filters_apply() {
        let r = registry();
        let except = ToolFilter::Except(HashSet::from(["mid".to_string()]));
        assert_eq!(r.definitions(&except).len(), 2);
        let only = ToolFilter::Only(HashSet::from(["zeta".to_string()]));
        let defs = r.definitions(&only);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "zeta");
    }

    #[test]
    fn register_replaces() {
        let mut r = registry();
        r.register(Arc::new(EchoTool::named("alpha")));
        assert_eq!(r.len(), 3);
        assert!(r.contains("alpha"));
        assert!(r.get("missing").is_none());
    }
}
