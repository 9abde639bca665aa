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

pub mod cliargs;
pub mod config;
pub mod connection;
pub mod demo;
pub mod gateway;
pub mod http1;
pub mod logger;
pub mod net;
pub mod pool;
pub mod reloader;
pub mod resolver;
pub mod supervisor;
pub mod worker;

pub use crate::gateway::{AppError, Application, BodyChunks, Environ, Responder, StatusLine};
pub use crate::resolver::{Registry, Resolver};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
