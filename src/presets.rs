//! Parameter documents for the whole vocal chain.
//!
//! A [`ChainParams`] round-trips through a JSON object keyed by field name. Loading
//! never fails on content: missing keys keep their defaults, keys with the wrong
//! type are treated as missing, unknown keys are ignored, and every value is
//! clamped into its documented range.

use std::collections::HashMap;

use anyhow::Context;
use log::warn;
use nih_plug::prelude::Enum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::dsp::utils::sanitize;
use crate::dsp::{
    CompressorParams, DelayParams, DynamicEqParams, EqParams, ExciterParams, HarmonizerParams,
    ReverbParams, SculptParams,
};

pub const MIC_COUNT: usize = 2;
const PREAMP_RANGE_DB: (f32, f32) = (-24.0, 24.0);
const DOCUMENT_VERSION: &str = "1.0";

/// Name of the preset that is always present.
pub const DEFAULT_PRESET: &str = "Default";

// =============================================================================
// DOCUMENTS
// =============================================================================

/// One microphone strip: preamp, routing flags and its four effect stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MicParams {
    #[serde(rename = "preampGain")]
    pub preamp_db: f32,
    pub mute: bool,
    /// Skip every stage of the strip and feed the raw (preamped) mic to the bus.
    pub fx_bypass: bool,
    pub exciter: ExciterParams,
    #[serde(rename = "excBypass")]
    pub exciter_bypassed: bool,
    pub sculpt: SculptParams,
    #[serde(rename = "sculptBypass")]
    pub sculpt_bypassed: bool,
    pub eq: EqParams,
    #[serde(rename = "eqBypass")]
    pub eq_bypassed: bool,
    pub compressor: CompressorParams,
    #[serde(rename = "compBypass")]
    pub compressor_bypassed: bool,
}

impl Default for MicParams {
    fn default() -> Self {
        Self {
            preamp_db: 0.0,
            mute: false,
            fx_bypass: false,
            exciter: ExciterParams::default(),
            exciter_bypassed: false,
            sculpt: SculptParams::default(),
            sculpt_bypassed: false,
            eq: EqParams::default(),
            eq_bypassed: false,
            compressor: CompressorParams::default(),
            compressor_bypassed: false,
        }
    }
}

impl MicParams {
    pub fn clamped(self) -> Self {
        Self {
            preamp_db: sanitize(self.preamp_db, 0.0, PREAMP_RANGE_DB.0, PREAMP_RANGE_DB.1),
            exciter: self.exciter.clamped(),
            sculpt: self.sculpt.clamped(),
            eq: self.eq.clamped(),
            compressor: self.compressor.clamped(),
            ..self
        }
    }

    fn from_value(doc: &Value) -> Self {
        let d = Self::default();
        let Some(obj) = doc.as_object() else {
            return d;
        };
        Self {
            preamp_db: field(obj, "preampGain").unwrap_or(d.preamp_db),
            mute: field(obj, "mute").unwrap_or(d.mute),
            fx_bypass: field(obj, "fxBypass").unwrap_or(d.fx_bypass),
            exciter: stage(obj, "exciter", &d.exciter),
            exciter_bypassed: field(obj, "excBypass").unwrap_or(d.exciter_bypassed),
            sculpt: stage(obj, "sculpt", &d.sculpt),
            sculpt_bypassed: field(obj, "sculptBypass").unwrap_or(d.sculpt_bypassed),
            eq: stage(obj, "eq", &d.eq),
            eq_bypassed: field(obj, "eqBypass").unwrap_or(d.eq_bypassed),
            compressor: stage(obj, "compressor", &d.compressor),
            compressor_bypassed: field(obj, "compBypass").unwrap_or(d.compressor_bypassed),
        }
        .clamped()
    }
}

/// Everything the vocal chain needs, as persisted by the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainParams {
    pub mics: [MicParams; MIC_COUNT],
    pub harmonizer: HarmonizerParams,
    #[serde(rename = "harmonizerBypass")]
    pub harmonizer_bypassed: bool,
    pub reverb: ReverbParams,
    #[serde(rename = "reverbBypass")]
    pub reverb_bypassed: bool,
    pub delay: DelayParams,
    #[serde(rename = "delayBypass")]
    pub delay_bypassed: bool,
    #[serde(rename = "dynamicEQ")]
    pub dynamic_eq: DynamicEqParams,
    #[serde(rename = "dynEqBypass")]
    pub dynamic_eq_bypassed: bool,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            mics: [MicParams::default(); MIC_COUNT],
            harmonizer: HarmonizerParams::default(),
            harmonizer_bypassed: true,
            reverb: ReverbParams::default(),
            reverb_bypassed: false,
            delay: DelayParams::default(),
            delay_bypassed: true,
            dynamic_eq: DynamicEqParams::default(),
            dynamic_eq_bypassed: false,
        }
    }
}

impl ChainParams {
    pub fn clamped(self) -> Self {
        Self {
            mics: self.mics.map(MicParams::clamped),
            harmonizer: self.harmonizer.clamped(),
            reverb: self.reverb.clamped(),
            delay: self.delay.clamped(),
            dynamic_eq: self.dynamic_eq.clamped(),
            ..self
        }
    }

    /// Build from an already parsed document. Never fails.
    pub fn from_value(doc: &Value) -> Self {
        let d = Self::default();
        let Some(obj) = doc.as_object() else {
            warn!("chain document is not an object, using defaults");
            return d;
        };

        let mut mics = d.mics;
        if let Some(list) = obj.get("mics").and_then(Value::as_array) {
            for (slot, mic) in mics.iter_mut().zip(list) {
                *slot = MicParams::from_value(mic);
            }
        }

        Self {
            mics,
            harmonizer: obj
                .get("harmonizer")
                .map_or(d.harmonizer, harmonizer_from_value),
            harmonizer_bypassed: field(obj, "harmonizerBypass").unwrap_or(d.harmonizer_bypassed),
            reverb: stage(obj, "reverb", &d.reverb),
            reverb_bypassed: field(obj, "reverbBypass").unwrap_or(d.reverb_bypassed),
            delay: stage(obj, "delay", &d.delay),
            delay_bypassed: field(obj, "delayBypass").unwrap_or(d.delay_bypassed),
            dynamic_eq: stage(obj, "dynamicEQ", &d.dynamic_eq),
            dynamic_eq_bypassed: field(obj, "dynEqBypass").unwrap_or(d.dynamic_eq_bypassed),
        }
        .clamped()
    }

    /// Parse document text. Only malformed JSON is an error.
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let doc: Value = serde_json::from_str(text).context("chain document is not valid JSON")?;
        Ok(Self::from_value(&doc))
    }

    /// Like [`ChainParams::from_json_str`], but falls back to defaults with a warning.
    pub fn from_json_str_or_default(text: &str) -> Self {
        match Self::from_json_str(text) {
            Ok(params) => params,
            Err(err) => {
                warn!("{err:#}, using defaults");
                Self::default()
            }
        }
    }

    /// Serialize as a versioned document.
    pub fn to_json_string(&self) -> anyhow::Result<String> {
        let mut doc = serde_json::to_value(self).context("failed to serialize chain parameters")?;
        if let Value::Object(obj) = &mut doc {
            obj.insert("version".to_owned(), Value::from(DOCUMENT_VERSION));
        }
        serde_json::to_string_pretty(&doc).context("failed to format chain document")
    }
}

impl<'de> Deserialize<'de> for ChainParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&doc))
    }
}

// =============================================================================
// LENIENT FIELD HELPERS
// =============================================================================

fn field<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> Option<T> {
    obj.get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn stage<T>(obj: &Map<String, Value>, key: &str, base: &T) -> T
where
    T: Serialize + DeserializeOwned + Clone,
{
    obj.get(key)
        .map_or_else(|| base.clone(), |doc| overlay(base, doc))
}

/// Apply the fields of `doc` onto `base` one at a time, skipping any that don't
/// deserialize. Unknown keys are dropped.
fn overlay<T>(base: &T, doc: &Value) -> T
where
    T: Serialize + DeserializeOwned + Clone,
{
    let Some(fields) = doc.as_object() else {
        return base.clone();
    };
    let mut merged = match serde_json::to_value(base) {
        Ok(Value::Object(m)) => m,
        _ => return base.clone(),
    };
    for (key, value) in fields {
        if !merged.contains_key(key) {
            continue;
        }
        let mut trial = merged.clone();
        trial.insert(key.clone(), value.clone());
        if serde_json::from_value::<T>(Value::Object(trial)).is_ok() {
            merged.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or_else(|_| base.clone())
}

/// Voices are overlaid one by one, each onto its own default.
fn harmonizer_from_value(doc: &Value) -> HarmonizerParams {
    let d = HarmonizerParams::default();
    let Some(obj) = doc.as_object() else {
        return d;
    };
    let mut voices = d.voices;
    if let Some(list) = obj.get("voices").and_then(Value::as_array) {
        for (slot, voice) in voices.iter_mut().zip(list) {
            *slot = overlay(slot, voice);
        }
    }
    HarmonizerParams {
        voices,
        wet_db: field(obj, "wetDb").unwrap_or(d.wet_db),
        glide_ms: field(obj, "glideMs").unwrap_or(d.glide_ms),
    }
}

// =============================================================================
// FACTORY PRESETS
// =============================================================================

/// Host-automatable preset selector. `Manual` keeps whatever state is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Enum)]
pub enum FactoryPreset {
    #[default]
    #[name = "Manual"]
    Manual,
    #[name = "Default"]
    Default,
    #[name = "Live Vocal"]
    LiveVocal,
}

impl FactoryPreset {
    /// Key into [`PresetLibrary`], `None` for `Manual`.
    pub fn preset_name(&self) -> Option<&'static str> {
        match self {
            FactoryPreset::Manual => None,
            FactoryPreset::Default => Some(DEFAULT_PRESET),
            FactoryPreset::LiveVocal => Some("Live Vocal"),
        }
    }
}

#[derive(Debug)]
pub struct PresetLibrary {
    presets: HashMap<String, ChainParams>,
}

impl PresetLibrary {
    /// Load the factory presets baked into the binary. A malformed bundle leaves
    /// only [`DEFAULT_PRESET`].
    pub fn new() -> Self {
        let mut library = Self::default();
        let bundle = include_str!("../presets.json");
        match serde_json::from_str::<HashMap<String, Value>>(bundle) {
            Ok(docs) => {
                for (name, doc) in docs {
                    library.presets.insert(name, ChainParams::from_value(&doc));
                }
            }
            Err(err) => warn!("factory presets unreadable: {err}"),
        }
        library
    }

    pub fn get(&self, name: &str) -> Option<&ChainParams> {
        self.presets.get(name)
    }

    /// Preset names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for PresetLibrary {
    fn default() -> Self {
        let mut presets = HashMap::new();
        presets.insert(DEFAULT_PRESET.to_string(), ChainParams::default());
        Self { presets }
    }
}
