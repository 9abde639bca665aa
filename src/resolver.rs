/*
 * Copyright (C) 2024-2025 the Zibai authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::gateway::Application;
use crate::worker::Hook;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

type AppFactory = Arc<dyn Fn() -> Arc<dyn Application> + Send + Sync>;
type HookFn = Arc<dyn Fn() -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync>;

enum AppEntry {
    App(Arc<dyn Application>),
    Factory(AppFactory),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("identifier {0:?} must be in format \"module:attribute\"")]
    BadFormat(String),

    #[error("unknown application {0:?}")]
    UnknownApp(String),

    #[error("unknown hook {0:?}")]
    UnknownHook(String),

    #[error("{0:?} resolves to a factory, pass --call to invoke it")]
    NeedsCall(String),
}

/// Resolves `module:attribute` identifiers from the CLI into applications
/// and lifecycle hooks.
pub trait Resolver: Send + Sync {
    fn resolve_app(&self, spec: &str, call: bool) -> Result<Arc<dyn Application>, ResolveError>;

    fn resolve_hook(&self, spec: &str) -> Result<Hook, ResolveError>;
}

fn check_format(spec: &str) -> Result<(), ResolveError> {
    match spec.split_once(':') {
        Some((module, attr)) if !module.is_empty() && !attr.is_empty() => Ok(()),
        _ => Err(ResolveError::BadFormat(spec.to_string())),
    }
}

/// A static table of registered applications and hooks. The host process
/// registers everything it is willing to serve; identifiers then resolve
/// against the table.
#[derive(Default)]
pub struct Registry {
    apps: HashMap<String, AppEntry>,
    hooks: HashMap<String, HookFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_app<A: Application + 'static>(&mut self, name: &str, app: A) {
        self.apps
            .insert(name.to_string(), AppEntry::App(Arc::new(app)));
    }

    pub fn register_factory<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Application> + Send + Sync + 'static,
    {
        self.apps
            .insert(name.to_string(), AppEntry::Factory(Arc::new(factory)));
    }

    pub fn register_hook<F>(&mut self, name: &str, hook: F)
    where
        F: Fn() -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync + 'static,
    {
        self.hooks.insert(name.to_string(), Arc::new(hook));
    }
}

impl Resolver for Registry {
    fn resolve_app(&self, spec: &str, call: bool) -> Result<Arc<dyn Application>, ResolveError> {
        check_format(spec)?;

        match self.apps.get(spec) {
            Some(AppEntry::App(app)) => Ok(Arc::clone(app)),
            Some(AppEntry::Factory(factory)) => {
                if !call {
                    return Err(ResolveError::NeedsCall(spec.to_string()));
                }

                Ok(factory())
            }
            None => Err(ResolveError::UnknownApp(spec.to_string())),
        }
    }

    fn resolve_hook(&self, spec: &str) -> Result<Hook, ResolveError> {
        check_format(spec)?;

        match self.hooks.get(spec) {
            Some(hook) => {
                let hook = Arc::clone(hook);
                Ok(Box::new(move || hook()))
            }
            None => Err(ResolveError::UnknownHook(spec.to_string())),
        }
    }
}
