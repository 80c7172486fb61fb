//! Extraction profiles: how to find consumable levels on one family of status pages.
//!
//! A profile names the container that must be present before extraction
//! starts and, per consumable, an ordered locator chain evaluated first match
//! wins. Locator strings may contain `{index}` (0-based position of the
//! consumable in the device's list) and `{ordinal}` (1-based).
//!
//! Profiles are selected by device group. The built-in set covers the printer
//! families seen in the field; `PROFILES_FILE` replaces it with a JSON list.

use scraper::Selector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::Path;

#[derive(Debug)]
pub enum ProfileError {
    Io(String),
    Json(String),
    Selector { profile: String, selector: String, message: String },
    Empty,
}

impl Display for ProfileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::Io(e) => write!(f, "read error: {}", e),
            ProfileError::Json(e) => write!(f, "json error: {}", e),
            ProfileError::Selector {
                profile,
                selector,
                message,
            } => write!(f, "profile {}: invalid selector {:?}: {}", profile, selector, message),
            ProfileError::Empty => write!(f, "no profiles defined"),
        }
    }
}

impl std::error::Error for ProfileError {}

/// Element whose presence marks the page as loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Container {
    /// An embedded `<frame>`/`<iframe>` matched by id or name; fields live in its document.
    Frame { id: String },
    /// Any element matched by a CSS selector in the top-level document.
    Element { selector: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    Id {
        id: String,
    },
    /// The `nth` (0-based) element matching `selector`.
    Css {
        selector: String,
        #[serde(default)]
        nth: usize,
    },
    /// The first element matching `selector` whose text contains `text`.
    CssContaining {
        selector: String,
        text: String,
    },
}

impl Locator {
    pub fn id(id: &str) -> Locator {
        Locator::Id { id: id.to_string() }
    }

    pub fn css(selector: &str, nth: usize) -> Locator {
        Locator::Css {
            selector: selector.to_string(),
            nth,
        }
    }

    pub fn css_containing(selector: &str, text: &str) -> Locator {
        Locator::CssContaining {
            selector: selector.to_string(),
            text: text.to_string(),
        }
    }

    /// CSS form of the locator, with placeholders substituted.
    pub fn selector(&self, index: usize) -> String {
        let raw = match self {
            Locator::Id { id } => format!("[id=\"{}\"]", id),
            Locator::Css { selector, .. } | Locator::CssContaining { selector, .. } => selector.clone(),
        };
        expand(&raw, index)
    }
}

fn expand(template: &str, index: usize) -> String {
    template
        .replace("{index}", &index.to_string())
        .replace("{ordinal}", &(index + 1).to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Device groups served by this profile, in addition to `name` itself.
    #[serde(default)]
    pub groups: Vec<String>,
    pub container: Container,
    /// Chain used for consumables without an entry in `fields`.
    #[serde(default)]
    pub default_locators: Vec<Locator>,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<Locator>>,
}

impl Profile {
    pub fn serves(&self, group: &str) -> bool {
        self.name == group || self.groups.iter().any(|g| g == group)
    }

    pub fn locators_for(&self, consumable: &str) -> &[Locator] {
        self.fields
            .get(consumable)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_locators)
    }

    fn check_selectors(&self) -> Result<(), ProfileError> {
        let mut selectors = Vec::new();
        if let Container::Element { selector } = &self.container {
            selectors.push(selector.clone());
        }
        for locator in self.default_locators.iter().chain(self.fields.values().flatten()) {
            selectors.push(locator.selector(0));
        }
        for selector in selectors {
            let message = match Selector::parse(&selector) {
                Ok(_) => continue,
                Err(e) => e.to_string(),
            };
            return Err(ProfileError::Selector {
                profile: self.name.clone(),
                selector,
                message,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSet {
    profiles: Vec<Profile>,
}

impl ProfileSet {
    pub fn new(profiles: Vec<Profile>) -> Result<Self, ProfileError> {
        if profiles.is_empty() {
            return Err(ProfileError::Empty);
        }
        for p in &profiles {
            p.check_selectors()?;
        }
        Ok(ProfileSet { profiles })
    }

    pub fn from_file(path: &Path) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|e| ProfileError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ProfileError> {
        let de = &mut serde_json::Deserializer::from_str(text);
        let profiles: Vec<Profile> =
            serde_path_to_error::deserialize(de).map_err(|e| ProfileError::Json(format!("at {}: {}", e.path(), e.inner())))?;
        Self::new(profiles)
    }

    pub fn for_group(&self, group: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.serves(group))
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn builtin() -> Self {
        ProfileSet {
            profiles: vec![hp_supply_gauge(), ricoh_mono(), ricoh_color()],
        }
    }
}

/// HP embedded web server: `SupplyGauge{n}` holds the n-th supply of the device.
fn hp_supply_gauge() -> Profile {
    Profile {
        name: "hp-supply-gauge".into(),
        groups: Vec::new(),
        container: Container::Element {
            selector: "[id=\"SupplyName0\"]".into(),
        },
        default_locators: vec![Locator::id("SupplyGauge{index}")],
        fields: BTreeMap::new(),
    }
}

const RICOH_MAIN_FRAME: &str = "ruifw_MainFrm";
// Cells of the generic level table; matches both `0%` and any level ending in `0%`.
const RICOH_LEVEL_CELL: &str = "table[width=\"100%\"][border=\"0\"] td";

fn ricoh_mono() -> Profile {
    let fallback = Locator::css_containing(RICOH_LEVEL_CELL, "0%");
    let fields = BTreeMap::from([
        (
            "Black Toner".to_string(),
            vec![Locator::css("table#toner_list td.tonervalue_number", 0), fallback.clone()],
        ),
        (
            "Black Imaging Unit".to_string(),
            vec![Locator::css("table#imagine_list td.tonervalue_number", 0), fallback],
        ),
    ]);
    Profile {
        name: "ricoh-mono".into(),
        groups: Vec::new(),
        container: Container::Frame {
            id: RICOH_MAIN_FRAME.into(),
        },
        default_locators: Vec::new(),
        fields,
    }
}

/// Colour models render one grid row per colour (`tr#1`..`tr#4`); the first
/// level cell in the row is the toner, the second the imaging unit.
fn ricoh_color() -> Profile {
    let mut fields = BTreeMap::new();
    for (row, colour) in ["Black", "Cyan", "Magenta", "Yellow"].iter().enumerate() {
        let cell = format!(
            "tr[id=\"{}\"] > td:nth-child(2) > table > tbody > tr > td > table > tbody > tr > td:nth-child(2)",
            row + 1
        );
        fields.insert(format!("{} Toner", colour), vec![Locator::css(&cell, 0)]);
        fields.insert(format!("{} Imaging Unit", colour), vec![Locator::css(&cell, 1)]);
    }
    Profile {
        name: "ricoh-color".into(),
        groups: Vec::new(),
        container: Container::Frame {
            id: RICOH_MAIN_FRAME.into(),
        },
        default_locators: Vec::new(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_have_valid_selectors() {
        let set = ProfileSet::builtin();
        for name in set.names() {
            let profile = set.for_group(name).expect("profile by name");
            profile.check_selectors().expect("selectors parse");
        }
    }

    #[test]
    fn locator_placeholders_expand() {
        let loc = Locator::id("SupplyGauge{index}");
        assert_eq!(loc.selector(2), "[id=\"SupplyGauge2\"]");
        let loc = Locator::css("tr[id=\"{ordinal}\"] td", 0);
        assert_eq!(loc.selector(0), "tr[id=\"1\"] td");
    }

    #[test]
    fn field_chain_overrides_default() {
        let set = ProfileSet::builtin();
        let mono = set.for_group("ricoh-mono").expect("mono");
        assert_eq!(mono.locators_for("Black Toner").len(), 2);
        assert!(mono.locators_for("Waste Toner").is_empty());

        let hp = set.for_group("hp-supply-gauge").expect("hp");
        assert_eq!(hp.locators_for("Maintenance Kit"), &[Locator::id("SupplyGauge{index}")]);
    }

    #[test]
    fn loads_profiles_from_json_with_group_aliases() {
        let json = r##"[
            {
                "name": "office-hp",
                "groups": ["HP Admin", "HP Plant"],
                "container": { "kind": "element", "selector": "#SupplyName0" },
                "default_locators": [ { "kind": "id", "id": "SupplyGauge{index}" } ]
            }
        ]"##;
        let set = ProfileSet::from_json(json).expect("parse");
        assert_eq!(set.for_group("HP Plant").map(|p| p.name.as_str()), Some("office-hp"));
        assert!(set.for_group("Color Admin").is_none());
    }

    #[test]
    fn json_errors_carry_the_path() {
        let json = r#"[ { "name": "x", "container": { "kind": "element" } } ]"#;
        let err = ProfileSet::from_json(json).unwrap_err();
        match err {
            ProfileError::Json(msg) => assert!(msg.contains("container"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_bad_selectors_and_empty_sets() {
        let json = r#"[ { "name": "x", "container": { "kind": "element", "selector": "td[[" } } ]"#;
        assert!(matches!(ProfileSet::from_json(json), Err(ProfileError::Selector { .. })));
        assert!(matches!(ProfileSet::from_json("[]"), Err(ProfileError::Empty)));
    }
}
