use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::events::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Light,
    Medium,
    Heavy,
    TankDestroyer,
}

const HEAVY_TOKENS: &[&str] = &[
    "tiger",
    "king tiger",
    "t-34-85",
    "is-2",
    "is2",
    "pershing",
    "panther",
    "jumbo 76",
    "sherman 76",
];
const MEDIUM_TOKENS: &[&str] = &[
    "sherman", "jumbo", "pz iv", "pzkpfw iv", "t-34", "t34", "comet", "cromwell",
];
const LIGHT_TOKENS: &[&str] = &[
    "stuart",
    "stewart",
    "luchs",
    "m8",
    "greyhound",
    "grey hound",
    "t70",
];
const TD_TOKENS: &[&str] = &["stug", "su-76", "m10", "achilles", "jpz", "jagdpanzer"];

/// Lightweight vehicle-name classifier; `None` for unknown or non-tank names.
pub fn classify_by_name(name: &str) -> Option<VehicleClass> {
    let needle = name.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return None;
    }
    let has_any = |tokens: &[&str]| tokens.iter().any(|token| needle.contains(token));
    if has_any(HEAVY_TOKENS) {
        return Some(VehicleClass::Heavy);
    }
    if has_any(MEDIUM_TOKENS) {
        return Some(VehicleClass::Medium);
    }
    if has_any(LIGHT_TOKENS) {
        return Some(VehicleClass::Light);
    }
    if has_any(TD_TOKENS) {
        return Some(VehicleClass::TankDestroyer);
    }
    None
}

fn classify_class_label(raw: &str) -> Option<VehicleClass> {
    let label = raw.trim().to_ascii_lowercase();
    if label.contains("heavy") {
        Some(VehicleClass::Heavy)
    } else if label.contains("medium") {
        Some(VehicleClass::Medium)
    } else if label.contains("light") {
        Some(VehicleClass::Light)
    } else if label.contains("destroyer") || label == "td" {
        Some(VehicleClass::TankDestroyer)
    } else {
        None
    }
}

/// Keyword -> category mapping matched by case-insensitive substring against
/// weapon and vehicle strings of inbound kill events.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    by_keyword: HashMap<String, String>,
}

impl KeywordSet {
    pub fn insert(&mut self, keyword: &str, category: &str) {
        let keyword = keyword.trim().to_ascii_lowercase();
        let category = category.trim().to_ascii_lowercase();
        if keyword.is_empty() || category.is_empty() {
            return;
        }
        self.by_keyword.insert(keyword, category);
    }

    pub fn len(&self) -> usize {
        self.by_keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_keyword.is_empty()
    }

    /// Default tank-relevant keywords used when no tanks file is configured.
    pub fn builtin() -> Self {
        let mut set = KeywordSet::default();
        for caliber in ["37mm", "50mm", "57mm", "75mm", "76mm", "88mm"] {
            set.insert(caliber, "calibers");
        }
        for launcher in ["panzerschreck", "bazooka", "piat"] {
            set.insert(launcher, "launchers");
        }
        set.insert("satchel", "explosives");
        set.insert("at gun", "cannons");
        set
    }

    /// Longest matching keyword wins so "88mm kwk" beats "88mm" when both are
    /// present.
    pub fn match_text(&self, text: &str) -> Option<(String, String)> {
        let haystack = text.to_ascii_lowercase();
        self.by_keyword
            .iter()
            .filter(|(keyword, _)| haystack.contains(keyword.as_str()))
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(keyword, category)| (keyword.clone(), category.clone()))
    }
}

/// Vehicle and gun-caliber keywords derived from a tanks roster file (a JSON
/// array of `{vehicle, class, side, country, gun}` entries).
pub fn derive_keywords_from_tanks_file(path: &Path) -> Result<KeywordSet> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed reading tanks file at {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid tanks file json at {}", path.display()))?;
    let entries = parsed
        .as_array()
        .with_context(|| format!("tanks file {} is not a JSON array", path.display()))?;

    let mut set = KeywordSet::default();
    for entry in entries {
        let Some(object) = entry.as_object() else {
            continue;
        };
        if let Some(vehicle) = object.get("vehicle").and_then(Value::as_str) {
            set.insert(vehicle, "vehicles");
        }
        if let Some(gun) = object.get("gun").and_then(Value::as_str) {
            for token in gun.split_whitespace() {
                if token.to_ascii_lowercase().ends_with("mm") {
                    set.insert(token, "calibers");
                }
            }
        }
    }
    Ok(set)
}

#[derive(Debug, Clone, Serialize)]
pub struct KillDetection {
    pub killer_name: String,
    pub killer_team: Option<Side>,
    pub victim_name: String,
    pub victim_team: Option<Side>,
    pub weapon: Option<String>,
    pub vehicle: Option<String>,
    pub vehicle_class: Option<VehicleClass>,
    pub keyword_group: String,
    pub keyword_match: String,
}

/// Decides whether an inbound kill payload counts as a tank kill. Weapon
/// keywords are checked first, then the vehicle name, then an explicit
/// vehicle-class field. Payloads that are not JSON mappings, and events with
/// no match, are discarded without side effects. A `data` envelope around the
/// fields is unwrapped transparently.
pub fn detect_tank_kill(payload: &Value, keywords: &KeywordSet) -> Option<KillDetection> {
    let top = payload.as_object()?;
    let inner = top.get("data").and_then(Value::as_object);

    let field = |names: &[&str]| -> Option<String> {
        for name in names {
            if let Some(found) = inner.and_then(|data| data.get(*name)).or_else(|| top.get(*name))
            {
                if let Some(text) = found.as_str() {
                    let text = text.trim();
                    if !text.is_empty() {
                        return Some(text.to_owned());
                    }
                }
            }
        }
        None
    };

    let weapon = field(&["weapon"]);
    let vehicle = field(&["victim_vehicle", "target_vehicle", "vehicle"]);
    let class_label = field(&["victim_vehicle_class", "vehicle_class"]);

    let matched = weapon
        .as_deref()
        .and_then(|text| keywords.match_text(text))
        .or_else(|| vehicle.as_deref().and_then(|text| keywords.match_text(text)))
        .or_else(|| {
            class_label
                .clone()
                .map(|label| (label, "vehicle_class".to_owned()))
        });
    let (keyword_match, keyword_group) = matched?;

    let vehicle_class = class_label
        .as_deref()
        .and_then(classify_class_label)
        .or_else(|| vehicle.as_deref().and_then(classify_by_name));

    Some(KillDetection {
        killer_name: field(&["killer_name", "attacker_name", "killer"])
            .unwrap_or_else(|| "Unknown".to_owned()),
        killer_team: field(&["killer_team", "attacker_team"])
            .as_deref()
            .and_then(Side::parse),
        victim_name: field(&["victim_name", "target_name", "victim"])
            .unwrap_or_else(|| "Unknown".to_owned()),
        victim_team: field(&["victim_team", "target_team"])
            .as_deref()
            .and_then(Side::parse),
        weapon,
        vehicle,
        vehicle_class,
        keyword_group,
        keyword_match,
    })
}
