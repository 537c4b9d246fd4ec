//! macOS key vocabulary: webdriver code points → System Events key codes.

use serde::{Deserialize, Serialize};

use super::{single_char, KeyError};

/// Modifier names understood by System Events.
pub const MODIFIERS: [&str; 5] = ["command", "control", "fn", "option", "shift"];

/// Key names mapped to System Events key codes.
///
/// - https://eastmanreference.com/complete-list-of-applescript-key-codes
/// - https://manytricks.com/keycodes/
pub const KEY_CODES: &[(&str, u8)] = &[
    ("a", 0),
    ("s", 1),
    ("d", 2),
    ("f", 3),
    ("h", 4),
    ("g", 5),
    ("z", 6),
    ("x", 7),
    ("c", 8),
    ("v", 9),
    ("b", 11),
    ("q", 12),
    ("w", 13),
    ("e", 14),
    ("r", 15),
    ("y", 16),
    ("t", 17),
    ("1", 18),
    ("2", 19),
    ("3", 20),
    ("4", 21),
    ("6", 22),
    ("5", 23),
    ("equal", 24),
    ("9", 25),
    ("7", 26),
    ("minus", 27),
    ("8", 28),
    ("0", 29),
    ("squareRight", 30),
    ("o", 31),
    ("u", 32),
    ("squareLeft", 33),
    ("i", 34),
    ("p", 35),
    ("return", 36),
    ("l", 37),
    ("j", 38),
    ("quote", 39),
    ("k", 40),
    ("semicolon", 41),
    ("backslash", 42),
    ("comma", 43),
    ("slash", 44),
    ("n", 45),
    ("m", 46),
    ("period", 47),
    ("tab", 48),
    ("space", 49),
    ("backtick", 50),
    ("backspace", 51),
    ("escape", 53),
    ("command", 55),
    ("shift", 57),
    ("option", 58),
    ("control", 59),
    ("fn", 63),
    ("numpadDecimal", 65),
    ("numpadMultiply", 67),
    ("numpadAdd", 69),
    ("numpadClear", 71),
    ("numpadDivide", 75),
    ("enter", 76),
    ("numpadSubtract", 78),
    ("numpadEqual", 81),
    ("numpad0", 82),
    ("numpad1", 83),
    ("numpad2", 84),
    ("numpad3", 85),
    ("numpad4", 86),
    ("numpad5", 87),
    ("numpad6", 88),
    ("numpad7", 89),
    ("numpad8", 91),
    ("numpad9", 92),
    ("f5", 96),
    ("f6", 97),
    ("f7", 98),
    ("f3", 99),
    ("f8", 100),
    ("f9", 101),
    ("f11", 103),
    ("f10", 109),
    ("f12", 111),
    ("help", 114),
    ("home", 115),
    ("pageUp", 116),
    ("delete", 117),
    ("f4", 118),
    ("end", 119),
    ("f2", 120),
    ("pageDown", 121),
    ("f1", 122),
    ("arrowLeft", 123),
    ("arrowRight", 124),
    ("arrowDown", 125),
    ("arrowUp", 126),
];

// Absent code points (unidentified, cancel, clear, insert, separator) have no
// System Events counterpart. `pause` is listed but has no key code, so it
// is rejected during translation.
const KEYBOARD_ACTIONS: &[(char, &str)] = &[
    ('\u{e002}', "help"),
    ('\u{e003}', "backspace"),
    ('\u{e004}', "tab"),
    ('\u{e006}', "return"),
    ('\u{e007}', "enter"),
    ('\u{e008}', "shift"),
    ('\u{e009}', "control"),
    ('\u{e00a}', "option"),
    ('\u{e00b}', "pause"),
    ('\u{e00c}', "escape"),
    ('\u{e00d}', "space"),
    ('\u{e00e}', "pageUp"),
    ('\u{e00f}', "pageDown"),
    ('\u{e010}', "end"),
    ('\u{e011}', "home"),
    ('\u{e012}', "arrowLeft"),
    ('\u{e013}', "arrowUp"),
    ('\u{e014}', "arrowRight"),
    ('\u{e015}', "arrowDown"),
    ('\u{e017}', "delete"),
    ('\u{e018}', "semicolon"),
    ('\u{e019}', "equal"),
    ('\u{e01a}', "numpad0"),
    ('\u{e01b}', "numpad1"),
    ('\u{e01c}', "numpad2"),
    ('\u{e01d}', "numpad3"),
    ('\u{e01e}', "numpad4"),
    ('\u{e01f}', "numpad5"),
    ('\u{e020}', "numpad6"),
    ('\u{e021}', "numpad7"),
    ('\u{e022}', "numpad8"),
    ('\u{e023}', "numpad9"),
    ('\u{e024}', "numpadMultiply"),
    ('\u{e025}', "numpadAdd"),
    ('\u{e027}', "numpadSubtract"),
    ('\u{e028}', "numpadDecimal"),
    ('\u{e029}', "numpadDivide"),
    ('\u{e031}', "f1"),
    ('\u{e032}', "f2"),
    ('\u{e033}', "f3"),
    ('\u{e034}', "f4"),
    ('\u{e035}', "f5"),
    ('\u{e036}', "f6"),
    ('\u{e037}', "f7"),
    ('\u{e038}', "f8"),
    ('\u{e039}', "f9"),
    ('\u{e03a}', "f10"),
    ('\u{e03b}', "f11"),
    ('\u{e03c}', "f12"),
    ('\u{e03d}', "command"),
    ('\u{e040}', "backtick"),
    ('\u{8}', "backspace"),
    ('\t', "tab"),
    (' ', "space"),
];

pub fn key_code(name: &str) -> Option<u8> {
    KEY_CODES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, code)| *code)
}

pub fn is_modifier(name: &str) -> bool {
    MODIFIERS.contains(&name)
}

fn keyboard_action(c: char) -> Option<&'static str> {
    KEYBOARD_ACTIONS
        .iter()
        .find(|(point, _)| *point == c)
        .map(|(_, action)| *action)
}

/// A key gesture split into modifiers and keys, ready to render.
///
/// Fields are plain names so a command can be built from anywhere; nothing
/// renders without passing [`KeyCommand::validate`] first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyCommand {
    pub key_codes: Vec<String>,
    pub modifiers: Vec<String>,
}

impl KeyCommand {
    pub fn new<K, M>(key_codes: K, modifiers: M) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        Self {
            key_codes: key_codes.into_iter().map(Into::into).collect(),
            modifiers: modifiers.into_iter().map(Into::into).collect(),
        }
    }

    /// Check every name against the key code and modifier vocabularies.
    pub fn validate(&self) -> Result<(), KeyError> {
        if let Some(code) = self.key_codes.iter().find(|code| key_code(code).is_none()) {
            return Err(KeyError::UnknownCode(code.clone()));
        }
        if let Some(modifier) = self.modifiers.iter().find(|m| !is_modifier(m)) {
            return Err(KeyError::UnknownModifier(modifier.clone()));
        }
        Ok(())
    }

    /// Modifiers followed by keys, the order in which they go down.
    pub fn press_order(&self) -> impl Iterator<Item = &str> {
        self.modifiers
            .iter()
            .chain(self.key_codes.iter())
            .map(String::as_str)
    }
}

/// Parse webdriver key code points into a [`KeyCommand`].
pub fn parse_code_points(codes: &[String]) -> Result<KeyCommand, KeyError> {
    let mut command = KeyCommand::default();
    for code in codes {
        let Some(c) = single_char(code) else {
            return Err(KeyError::InvalidKeyCode);
        };
        let name = keyboard_action(c).unwrap_or(code.as_str());
        if is_modifier(name) {
            command.modifiers.push(name.to_string());
        } else if key_code(name).is_some() {
            command.key_codes.push(name.to_string());
        } else {
            return Err(KeyError::unknown_key(code));
        }
    }
    Ok(command)
}
