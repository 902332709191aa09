use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::dispatch::RemoteDispatchChannel;
use crate::protocol::{ENABLE_NAVIGATION_INTERCEPTION, NAVIGATE_TO};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("uri helper used before initialize")]
    NotInitialized,

    #[error("invalid uri '{uri}': {reason}")]
    Invalid { uri: String, reason: String },

    #[error("the uri '{absolute}' is not contained by the base uri '{base}'")]
    NotContained { absolute: String, base: String },
}

type LocationHandler = Box<dyn FnMut(&str) + Send>;

struct UriState {
    absolute: String,
    // Both forms are kept so neither has to be rebuilt on demand.
    base: Url,
    base_string: String,
}

/// Per-circuit view of the remote location.
pub struct RemoteUriHelper {
    channel: Arc<RemoteDispatchChannel>,
    state: Option<UriState>,
    handlers: Vec<LocationHandler>,
}

impl RemoteUriHelper {
    pub fn new(channel: Arc<RemoteDispatchChannel>) -> Self {
        Self {
            channel,
            state: None,
            handlers: Vec::new(),
        }
    }

    pub fn initialize(&mut self, uri: &str, base_uri: &str) -> Result<(), UriError> {
        let base_string = to_base_uri(base_uri);
        let base = Url::parse(&base_string).map_err(|err| UriError::Invalid {
            uri: base_string.clone(),
            reason: err.to_string(),
        })?;

        self.state = Some(UriState {
            absolute: uri.to_string(),
            base,
            base_string,
        });

        self.channel
            .begin_invoke_js(0, ENABLE_NAVIGATION_INTERCEPTION, "[]");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn absolute_uri(&self) -> Result<&str, UriError> {
        Ok(&self.state()?.absolute)
    }

    pub fn base_uri(&self) -> Result<&str, UriError> {
        Ok(&self.state()?.base_string)
    }

    pub fn navigate_to(&self, uri: &str) {
        let args = serde_json::json!([uri]).to_string();
        self.channel.begin_invoke_js(0, NAVIGATE_TO, &args);
    }

    pub fn to_absolute_uri(&self, relative: &str) -> Result<Url, UriError> {
        self.state()?
            .base
            .join(relative)
            .map_err(|err| UriError::Invalid {
                uri: relative.to_string(),
                reason: err.to_string(),
            })
    }

    pub fn to_base_relative_path(&self, base: &str, absolute: &str) -> Result<String, UriError> {
        if let Some(rest) = absolute.strip_prefix(base) {
            return Ok(rest.to_string());
        }

        // "/app" is treated as being at "/app/".
        if format!("{absolute}/") == base {
            return Ok(String::new());
        }

        Err(UriError::NotContained {
            absolute: absolute.to_string(),
            base: base.to_string(),
        })
    }

    pub fn on_location_changed<F>(&mut self, handler: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn notify_location_changed(&mut self, uri: &str) -> Result<(), UriError> {
        let state = self.state.as_mut().ok_or(UriError::NotInitialized)?;
        state.absolute = uri.to_string();

        for handler in &mut self.handlers {
            handler(uri);
        }

        Ok(())
    }

    fn state(&self) -> Result<&UriState, UriError> {
        self.state.as_ref().ok_or(UriError::NotInitialized)
    }
}

/// Everything up to and including the last `/`, or `/` when there is none.
fn to_base_uri(absolute_base: &str) -> String {
    match absolute_base.rfind('/') {
        Some(index) => absolute_base[..=index].to_string(),
        None => "/".to_string(),
    }
}
