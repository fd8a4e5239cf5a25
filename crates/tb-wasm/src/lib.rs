//! WebAssembly bindings for TimeBlocker
//!
//! The extension's background script owns one [`Background`] and feeds it
//! storage contents, browser events, popup messages and timer ticks. Every
//! call returns plain JS objects; effects come back as
//! `{ redirects, notifications, persist }` where `persist` is ready to be
//! handed to the storage API (or `null`).

mod logging;

use serde_json::Value;
use wasm_bindgen::prelude::*;

use tb_core::{
    dispatch::{handle_event, handle_message, handle_tick},
    domain::{matches, normalize_domain_input},
    state::{decode, encode, StateKeys},
    url::{extract_host, host_of_url},
    BlockDecisionEngine, BrowserEvent, Effect, Message, Millis, StoreMap, TrackerConfig,
    TrackerState,
};

pub use logging::init_logging;

// =============================================================================
// Background
// =============================================================================

#[wasm_bindgen]
pub struct Background {
    state: TrackerState,
    engine: BlockDecisionEngine,
    config: TrackerConfig,
}

#[wasm_bindgen]
impl Background {
    /// Create a background object. `config_json` may omit any field.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<Background, JsValue> {
        let config = match config_json.as_deref() {
            Some(json) if !json.trim().is_empty() => TrackerConfig::from_json_str(json)
                .map_err(|e| JsValue::from_str(&format!("Invalid config: {}", e)))?,
            _ => TrackerConfig::default(),
        };
        Ok(Background {
            state: TrackerState::new(),
            engine: BlockDecisionEngine::new(&config),
            config,
        })
    }

    /// Replace the state with storage contents (the result of a storage
    /// `get`, as JSON). Malformed records are skipped and logged.
    pub fn load(&mut self, stored_json: &str, now: f64) -> Result<JsValue, JsValue> {
        let map: StoreMap = serde_json::from_str(stored_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid storage contents: {}", e)))?;
        let (stored, problems) = decode(&map);
        for problem in &problems {
            log::warn!("Skipping stored record: {}", problem);
        }

        let now = now as Millis;
        let today = self.engine.today(now);
        self.state = TrackerState::from_stored(stored, now, &today);

        let mut effects = Vec::new();
        if self.state.budgets.roll_over_all(&today) {
            effects.push(Effect::Persist(StateKeys::WEBSITES));
        }
        let result = self.effects_to_js(effects)?;
        let _ = js_sys::Reflect::set(&result, &"skipped".into(), &JsValue::from(problems.len() as u32));
        Ok(result.into())
    }

    /// Apply a browser event (`{ type: "navigationAttempt", ... }`).
    #[wasm_bindgen(js_name = handleEvent)]
    pub fn handle_event(&mut self, event_json: &str) -> Result<JsValue, JsValue> {
        let event: BrowserEvent = serde_json::from_str(event_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid event: {}", e)))?;
        let effects = handle_event(&mut self.state, &self.engine, &self.config, &event);
        Ok(self.effects_to_js(effects)?.into())
    }

    /// Apply a popup or content-script message (`{ action: ..., ... }`).
    /// Returns the effects object with an extra `reply` field.
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&mut self, message_json: &str, now: f64) -> Result<JsValue, JsValue> {
        let message: Message = serde_json::from_str(message_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid message: {}", e)))?;
        let (reply, effects) = handle_message(&mut self.state, &self.engine, &message, now as Millis);

        let result = self.effects_to_js(effects)?;
        let reply = to_js(&reply)?;
        let _ = js_sys::Reflect::set(&result, &"reply".into(), &reply);
        Ok(result.into())
    }

    /// Periodic re-check; call from the extension's timer.
    pub fn tick(&mut self, now: f64) -> Result<JsValue, JsValue> {
        let effects = handle_tick(&mut self.state, &self.engine, now as Millis);
        Ok(self.effects_to_js(effects)?.into())
    }

    /// Decision for `hostname` without side effects.
    pub fn decide(&self, hostname: &str, now: f64) -> Result<JsValue, JsValue> {
        to_js(&self.engine.decide(&self.state, hostname, now as Millis))
    }

    /// Everything persisted, encoded for storage.
    #[wasm_bindgen(js_name = exportState)]
    pub fn export_state(&self) -> Result<JsValue, JsValue> {
        to_js(&Value::Object(encode(&self.state, StateKeys::ALL)))
    }

    #[wasm_bindgen(getter, js_name = blockedPageUrl)]
    pub fn blocked_page_url(&self) -> String {
        self.config.blocked_page_url.clone()
    }
}

impl Background {
    fn effects_to_js(&self, effects: Vec<Effect>) -> Result<js_sys::Object, JsValue> {
        let redirects = js_sys::Array::new();
        let notifications = js_sys::Array::new();
        let mut persist = JsValue::NULL;

        for effect in effects {
            match effect {
                Effect::RedirectTab { tab_id, url } => {
                    let redirect = js_sys::Object::new();
                    let _ = js_sys::Reflect::set(&redirect, &"tabId".into(), &JsValue::from(tab_id));
                    let _ = js_sys::Reflect::set(&redirect, &"url".into(), &JsValue::from_str(&url));
                    redirects.push(&redirect);
                }
                Effect::Notify { tab_id, decision } => {
                    let notification = js_sys::Object::new();
                    let _ = js_sys::Reflect::set(&notification, &"tabId".into(), &JsValue::from(tab_id));
                    let _ = js_sys::Reflect::set(&notification, &"decision".into(), &to_js(&decision)?);
                    notifications.push(&notification);
                }
                Effect::Persist(keys) => {
                    persist = to_js(&Value::Object(encode(&self.state, keys)))?;
                }
            }
        }

        let result = js_sys::Object::new();
        let _ = js_sys::Reflect::set(&result, &"redirects".into(), &redirects);
        let _ = js_sys::Reflect::set(&result, &"notifications".into(), &notifications);
        let _ = js_sys::Reflect::set(&result, &"persist".into(), &persist);
        Ok(result)
    }
}

fn to_js<T: serde::Serialize + ?Sized>(value: &T) -> Result<JsValue, JsValue> {
    let text = serde_json::to_string(value)
        .map_err(|e| JsValue::from_str(&format!("Failed to encode: {}", e)))?;
    js_sys::JSON::parse(&text)
}

// =============================================================================
// Helpers for the popup and content scripts
// =============================================================================

#[wasm_bindgen]
pub fn domain_matches(hostname: &str, registered: &str) -> bool {
    matches(&hostname.to_ascii_lowercase(), &registered.to_ascii_lowercase())
}

#[wasm_bindgen]
pub fn normalize_domain(input: &str) -> Result<String, JsValue> {
    normalize_domain_input(input).map_err(|e| JsValue::from_str(&e.to_string()))
}

#[wasm_bindgen]
pub fn extract_host_js(url: &str) -> Option<String> {
    extract_host(url).map(|h| h.to_string())
}

/// Lowercase host of a web page URL; `undefined` for `chrome://` and the
/// like.
#[wasm_bindgen]
pub fn host_of_url_js(url: &str) -> Option<String> {
    host_of_url(url)
}
