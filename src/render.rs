//! Template rendering used to expand process scripts and outputs per job.

use serde_json::Value;

/// Turns a template and a per-job context into text.
///
/// The context has the shape
/// `{"i": {..inputs}, "job": {"index", "dir", "outdir"}, "proc": {"id", "tag", "suffix"}}`.
pub trait Render: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> anyhow::Result<String>;
}

/// Leaves templates untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbatim;

impl Render for Verbatim {
    fn render(&self, template: &str, _: &Value) -> anyhow::Result<String> {
        Ok(template.to_string())
    }
}

/// Jinja templates rendered by `minijinja`.
#[cfg(feature = "minijinja")]
pub struct MiniJinja {
    env: minijinja::Environment<'static>,
}

#[cfg(feature = "minijinja")]
impl MiniJinja {
    pub fn new() -> Self {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        Self { env }
    }

    /// Access the environment to register filters or globals.
    pub fn env_mut(&mut self) -> &mut minijinja::Environment<'static> {
        &mut self.env
    }
}

#[cfg(feature = "minijinja")]
impl Default for MiniJinja {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "minijinja")]
impl Render for MiniJinja {
    fn render(&self, template: &str, context: &Value) -> anyhow::Result<String> {
        Ok(self.env.render_str(template, context)?)
    }
}
