//! Native helpers exposed to the prelude.
//!
//! None of these throw into JS: failures come back as `undefined` (an
//! `Option::None`) and the prelude turns them into the appropriate JS error.
//! Byte strings use one code unit per byte ("binary strings").

use super::resolve::ModuleResolver;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rquickjs::{Ctx, Function, Object};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Global the prelude picks the helpers up from.
pub const HOST_GLOBAL: &str = "__edge_host";

/// Tracing target for plugin `console` output.
pub const PLUGIN_LOG_TARGET: &str = "edge_runner::plugin";

/// Install the helper object on the context's global scope.
pub fn install<'js>(
    ctx: &Ctx<'js>,
    module: &str,
    env_json: String,
    resolver: Arc<ModuleResolver>,
) -> rquickjs::Result<()> {
    let host = Object::new(ctx.clone())?;

    let module_name = module.to_string();
    host.set(
        "log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            plugin_log(&module_name, &level, &message)
        })?,
    )?;
    host.set(
        "resolve",
        Function::new(ctx.clone(), move |from_dir: String, specifier: String| {
            resolver.resolve_json(&from_dir, &specifier)
        })?,
    )?;
    host.set("utf8Encode", Function::new(ctx.clone(), utf8_encode)?)?;
    host.set("utf8Decode", Function::new(ctx.clone(), utf8_decode)?)?;
    host.set("base64Encode", Function::new(ctx.clone(), base64_encode)?)?;
    host.set("base64Decode", Function::new(ctx.clone(), base64_decode)?)?;
    host.set("hexEncode", Function::new(ctx.clone(), hex_encode)?)?;
    host.set("hexDecode", Function::new(ctx.clone(), hex_decode)?)?;
    host.set("digest", Function::new(ctx.clone(), digest)?)?;
    host.set("randomUUID", Function::new(ctx.clone(), random_uuid)?)?;
    host.set("env", env_json)?;

    ctx.globals().set(HOST_GLOBAL, host)
}

fn plugin_log(module: &str, level: &str, message: &str) {
    match level {
        "error" => error!(target: PLUGIN_LOG_TARGET, module, "{message}"),
        "warn" => warn!(target: PLUGIN_LOG_TARGET, module, "{message}"),
        "debug" => debug!(target: PLUGIN_LOG_TARGET, module, "{message}"),
        "trace" => trace!(target: PLUGIN_LOG_TARGET, module, "{message}"),
        _ => info!(target: PLUGIN_LOG_TARGET, module, "{message}"),
    }
}

pub(crate) fn to_binary(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

pub(crate) fn from_binary(binary: &str) -> Vec<u8> {
    binary.chars().map(|c| (u32::from(c) & 0xff) as u8).collect()
}

fn utf8_encode(text: String) -> String {
    to_binary(text.as_bytes())
}

fn utf8_decode(binary: String) -> String {
    String::from_utf8_lossy(&from_binary(&binary)).into_owned()
}

fn base64_encode(binary: String) -> String {
    STANDARD.encode(from_binary(&binary))
}

fn base64_decode(text: String) -> Option<String> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let unpadded = cleaned.trim_end_matches('=');
    let normalized = unpadded.replace('+', "-").replace('/', "_");
    URL_SAFE_NO_PAD
        .decode(normalized)
        .ok()
        .map(|bytes| to_binary(&bytes))
}

fn hex_encode(binary: String) -> String {
    hex::encode(from_binary(&binary))
}

fn hex_decode(text: String) -> Option<String> {
    hex::decode(text.trim()).ok().map(|bytes| to_binary(&bytes))
}

fn digest(algorithm: String, binary: String) -> Option<String> {
    let data = from_binary(&binary);
    let out = match algorithm.as_str() {
        "sha224" | "sha-224" => Sha224::digest(&data).to_vec(),
        "sha256" | "sha-256" => Sha256::digest(&data).to_vec(),
        "sha384" | "sha-384" => Sha384::digest(&data).to_vec(),
        "sha512" | "sha-512" => Sha512::digest(&data).to_vec(),
        _ => return None,
    };
    Some(to_binary(&out))
}

fn random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
