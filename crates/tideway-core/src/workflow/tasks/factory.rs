//! Compiles task nodes into executable units.
//!
//! One compiler per task kind, registered in a lookup table keyed by
//! [`TaskKindTag`]. Composite kinds recurse through the [`Builder`].

use std::collections::HashMap;

use tideway_types::workflow::{TaskKind, TaskKindTag, TaskList, TaskNode, WorkflowDefinition};

use crate::workflow::options::ActivityOptions;

use super::error::BuildError;
use super::sequence::DoTask;
use super::{ExecutableUnit, call, for_each, fork, listen, raise, sequence, set, switch, try_catch, wait};

/// Compiler for one task kind.
pub type Compiler = fn(&Builder<'_>, &TaskNode) -> Result<ExecutableUnit, BuildError>;

pub struct TaskFactory {
    compilers: HashMap<TaskKindTag, Compiler>,
}

impl Default for TaskFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskFactory {
    /// Factory with every supported kind registered.
    pub fn new() -> Self {
        let mut factory = Self {
            compilers: HashMap::new(),
        };
        factory.register(TaskKindTag::Set, set::compile);
        factory.register(TaskKindTag::CallHttp, call::compile);
        factory.register(TaskKindTag::CallGrpc, call::compile);
        factory.register(TaskKindTag::CallFunction, call::compile);
        factory.register(TaskKindTag::Switch, switch::compile);
        factory.register(TaskKindTag::For, for_each::compile);
        factory.register(TaskKindTag::Fork, fork::compile);
        factory.register(TaskKindTag::Try, try_catch::compile);
        factory.register(TaskKindTag::Wait, wait::compile);
        factory.register(TaskKindTag::Raise, raise::compile);
        factory.register(TaskKindTag::Listen, listen::compile);
        factory.register(TaskKindTag::Do, sequence::compile);
        factory
    }

    /// Register or replace the compiler for a kind.
    pub fn register(&mut self, tag: TaskKindTag, compiler: Compiler) {
        self.compilers.insert(tag, compiler);
    }

    pub fn supports(&self, tag: TaskKindTag) -> bool {
        self.compilers.contains_key(&tag)
    }

    /// Compile the whole document into its root sequence.
    pub fn build_workflow(&self, definition: &WorkflowDefinition) -> Result<DoTask, BuildError> {
        let builder = Builder {
            factory: self,
            definition,
        };
        builder.sequence(&definition.document.name, &definition.tasks, "", true)
    }
}

/// Build-time view handed to every compiler.
pub struct Builder<'a> {
    factory: &'a TaskFactory,
    definition: &'a WorkflowDefinition,
}

impl<'a> Builder<'a> {
    pub fn definition(&self) -> &'a WorkflowDefinition {
        self.definition
    }

    /// Compile one node through the lookup table.
    pub fn build(&self, node: &TaskNode) -> Result<ExecutableUnit, BuildError> {
        if let TaskKind::Unrecognized { keys } = &node.kind {
            return Err(BuildError::UnknownTaskKind {
                task: node.name.clone(),
                keys: keys.clone(),
            });
        }
        let tag = node.kind.tag();
        let compiler = self
            .factory
            .compilers
            .get(&tag)
            .ok_or_else(|| BuildError::UnsupportedKind {
                task: node.name.clone(),
                kind: tag.to_string(),
            })?;
        compiler(self, node)
    }

    /// Compile a task list into a sequence. `id_prefix` qualifies child ids
    /// so that nested sequences never collide with their parents.
    pub fn sequence(&self, name: &str, tasks: &TaskList, id_prefix: &str, root: bool) -> Result<DoTask, BuildError> {
        DoTask::build(self, name, tasks, id_prefix, root)
    }

    /// Resolved activity options for a task.
    pub fn activity_options(&self, node: &TaskNode) -> Result<ActivityOptions, BuildError> {
        let timeout = node.base.timeout.as_ref().map(|t| &t.after);
        Ok(ActivityOptions::resolve(self.definition, &node.name, timeout, &node.base.metadata)?)
    }
}
