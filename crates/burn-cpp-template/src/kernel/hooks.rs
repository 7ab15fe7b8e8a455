use super::KernelArgs;
use crate::error::{Result, TemplateError};

/// Deferred generator of the text replacing a placeholder.
///
/// Hooks run once the whole kernel text is known, so they see every argument registered while
/// rendering.
pub type RenderHook = Box<dyn FnOnce(&KernelArgs) -> Result<String>>;

/// Ordered registry of placeholders waiting for their text.
#[derive(Default)]
pub struct RenderHooks {
    hooks: Vec<(String, RenderHook)>,
}

impl RenderHooks {
    /// Register a hook, failing if the placeholder is already taken.
    pub fn register<S: Into<String>>(&mut self, placeholder: S, hook: RenderHook) -> Result<()> {
        let placeholder = placeholder.into();

        if self.contains(&placeholder) {
            return Err(TemplateError::DuplicatePlaceholder(placeholder));
        }

        log::trace!("Registering render hook {placeholder}");
        self.hooks.push((placeholder, hook));
        Ok(())
    }

    pub fn contains(&self, placeholder: &str) -> bool {
        self.hooks.iter().any(|(name, _)| name == placeholder)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Placeholders in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Remove and return the hooks whose placeholder contains `marker`, keeping their order.
    pub fn take_matching(&mut self, marker: &str) -> RenderHooks {
        let (taken, kept): (Vec<_>, Vec<_>) = core::mem::take(&mut self.hooks)
            .into_iter()
            .partition(|(name, _)| name.contains(marker));
        self.hooks = kept;

        RenderHooks { hooks: taken }
    }

    /// Drop the hooks registered after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        for (placeholder, _) in self.hooks.drain(len.min(self.hooks.len())..) {
            log::trace!("Dropping render hook {placeholder}");
        }
    }

    /// Remove and return every hook.
    pub fn take_all(&mut self) -> RenderHooks {
        RenderHooks {
            hooks: core::mem::take(&mut self.hooks),
        }
    }
}

impl core::fmt::Debug for RenderHooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Kernel text whose placeholders are still to be substituted.
#[derive(new)]
pub struct PartialRender {
    code: String,
    hooks: RenderHooks,
}

impl PartialRender {
    /// Run every hook and substitute all occurrences of its placeholder.
    pub fn finalize_all(self, args: &KernelArgs) -> Result<String> {
        let mut code = self.code;

        for (placeholder, hook) in self.hooks.hooks {
            let text = hook(args)?;
            log::trace!("Resolved {placeholder} => {text}");
            code = code.replace(&placeholder, &text);
        }

        Ok(code)
    }
}
