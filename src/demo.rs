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

use crate::gateway::{AppError, BodyChunks, Environ, Responder, StatusLine};
use crate::logger;
use crate::resolver::Registry;
use log::info;
use std::io::Read;

/// Demo application: GET returns a greeting, POST echoes the request body
/// back chunk by chunk.
pub fn app(environ: Environ, responder: &mut Responder) -> Result<BodyChunks, AppError> {
    match environ.request_method.as_str() {
        "POST" => {
            responder.start(StatusLine::new(200, "OK"), vec![], None)?;

            let mut input = environ.input;

            Ok(Box::new(std::iter::from_fn(move || {
                let mut buf = [0u8; 16384];

                match input.read(&mut buf) {
                    Ok(0) => None,
                    Ok(n) => Some(Ok(buf[..n].to_vec())),
                    Err(e) => Some(Err(e.into())),
                }
            })))
        }
        _ => {
            responder.start(
                StatusLine::new(200, "OK"),
                vec![
                    (
                        "Content-Type".to_string(),
                        b"text/plain; charset=utf-8".to_vec(),
                    ),
                    ("Content-Length".to_string(), b"12".to_vec()),
                ],
                None,
            )?;

            Ok(Box::new(std::iter::once(Ok(b"Hello World!".to_vec()))))
        }
    }
}

/// The registry served by the zibai binary.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();

    registry.register_app("zibai:app", app);
    registry.register_factory("zibai:make_app", || std::sync::Arc::new(app));

    registry.register_hook("zibai:before_serve", || {
        info!(target: logger::PROCESS, "starting server");
        Ok(())
    });

    registry.register_hook("zibai:before_graceful_exit", || {
        info!(target: logger::PROCESS, "graceful exit");
        Ok(())
    });

    registry.register_hook("zibai:before_died", || {
        info!(target: logger::PROCESS, "goodbye");
        Ok(())
    });

    registry
}
