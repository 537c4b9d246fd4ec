//! Windows key vocabulary: webdriver code points → key toggle names.
//!
//! Names follow the conventional virtual-key spellings (`alt` rather than
//! `option`, `left` rather than `arrowLeft`). Anything outside the webdriver
//! private-use range passes through untouched and is assumed to be a
//! printable character; the toggler rejects it later if it is not.

use std::ops::RangeInclusive;

use super::KeyError;

const WEBDRIVER_RANGE: RangeInclusive<char> = '\u{e000}'..='\u{e05d}';

// Absent code points have no toggle counterpart.
const KEYBOARD_ACTIONS: &[(char, &str)] = &[
    ('\u{e003}', "backspace"),
    ('\u{e004}', "tab"),
    ('\u{e007}', "enter"),
    ('\u{e008}', "shift"),
    ('\u{e009}', "control"),
    ('\u{e00a}', "alt"),
    ('\u{e00b}', "pause"),
    ('\u{e00c}', "escape"),
    ('\u{e00d}', "space"),
    ('\u{e00e}', "pageup"),
    ('\u{e00f}', "pagedown"),
    ('\u{e010}', "end"),
    ('\u{e011}', "home"),
    ('\u{e012}', "left"),
    ('\u{e013}', "up"),
    ('\u{e014}', "right"),
    ('\u{e015}', "down"),
    ('\u{e016}', "insert"),
    ('\u{e017}', "delete"),
    ('\u{e018}', ";"),
    ('\u{e019}', "="),
    ('\u{e01a}', "numpad_0"),
    ('\u{e01b}', "numpad_1"),
    ('\u{e01c}', "numpad_2"),
    ('\u{e01d}', "numpad_3"),
    ('\u{e01e}', "numpad_4"),
    ('\u{e01f}', "numpad_5"),
    ('\u{e020}', "numpad_6"),
    ('\u{e021}', "numpad_7"),
    ('\u{e022}', "numpad_8"),
    ('\u{e023}', "numpad_9"),
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
    ('\u{e040}', "`"),
];

fn keyboard_action(code: &str) -> Option<&'static str> {
    let mut chars = code.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    KEYBOARD_ACTIONS
        .iter()
        .find(|(point, _)| *point == c)
        .map(|(_, name)| *name)
}

/// Translate a key combination into toggle names, in press order.
pub fn translate(codes: &[String]) -> Result<Vec<String>, KeyError> {
    codes
        .iter()
        .map(|code| {
            if let Some(name) = keyboard_action(code) {
                Ok(name.to_string())
            } else if code.chars().any(|c| WEBDRIVER_RANGE.contains(&c)) {
                Err(KeyError::unknown_key(code))
            } else {
                Ok(code.clone())
            }
        })
        .collect()
}
