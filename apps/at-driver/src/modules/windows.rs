use async_trait::async_trait;
use at_driver_proto::Capabilities;
use tracing::{debug, warn};

use super::{CommandError, CommandModule, UNKNOWN_CAPABILITY};
use crate::keys::windows::translate;
use crate::keys::KeyCombination;
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Down,
    Up,
}

/// Synthesizes a single key transition on the host keyboard.
pub trait KeyToggler: Send + Sync + 'static {
    fn toggle(&self, key: &str, direction: KeyDirection) -> Result<(), CommandError>;
}

/// Screen reader on Windows. Keys are injected as OS input events.
pub struct WindowsModule<T = SystemKeyboard> {
    toggler: T,
}

impl Default for WindowsModule<SystemKeyboard> {
    fn default() -> Self {
        Self::new(SystemKeyboard)
    }
}

impl<T: KeyToggler> WindowsModule<T> {
    pub fn new(toggler: T) -> Self {
        Self { toggler }
    }

    pub fn toggler(&self) -> &T {
        &self.toggler
    }
}

#[async_trait]
impl<T: KeyToggler> CommandModule for WindowsModule<T> {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    async fn capabilities(&self) -> Capabilities {
        Capabilities {
            at_name: UNKNOWN_CAPABILITY.to_string(),
            at_version: UNKNOWN_CAPABILITY.to_string(),
            platform_name: Platform::Windows.wire_name().to_string(),
        }
    }

    async fn press_keys(&self, keys: &KeyCombination) -> Result<(), CommandError> {
        let names = translate(keys)?;
        debug!(keys = ?names, "toggling keys");

        let mut pressed = 0;
        let mut outcome = Ok(());
        for name in &names {
            if let Err(err) = self.toggler.toggle(name, KeyDirection::Down) {
                outcome = Err(err);
                break;
            }
            pressed += 1;
        }

        // Whatever went down comes back up, even after a failed press.
        for name in names[..pressed].iter().rev() {
            if let Err(err) = self.toggler.toggle(name, KeyDirection::Up) {
                warn!(key = %name, error = %err, "failed to release key");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }
}

/// Injects keystrokes through the Win32 input queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKeyboard;

#[cfg(windows)]
impl KeyToggler for SystemKeyboard {
    fn toggle(&self, key: &str, direction: KeyDirection) -> Result<(), CommandError> {
        use enigo::{Direction, Enigo, Keyboard, Settings};

        let key = system::enigo_key(key)?;
        let mut enigo = Enigo::new(&Settings::default())
            .map_err(|err| CommandError::Input(err.to_string()))?;
        let direction = match direction {
            KeyDirection::Down => Direction::Press,
            KeyDirection::Up => Direction::Release,
        };
        enigo
            .key(key, direction)
            .map_err(|err| CommandError::Input(err.to_string()))
    }
}

#[cfg(not(windows))]
impl KeyToggler for SystemKeyboard {
    fn toggle(&self, _key: &str, _direction: KeyDirection) -> Result<(), CommandError> {
        Err(CommandError::Input(
            "key toggling is only available on Windows".to_string(),
        ))
    }
}

#[cfg(windows)]
mod system {
    use enigo::Key;

    use super::CommandError;
    use crate::keys::{single_char, KeyError};

    pub(super) fn enigo_key(name: &str) -> Result<Key, CommandError> {
        let key = match name {
            "backspace" => Key::Backspace,
            "tab" => Key::Tab,
            "enter" => Key::Return,
            "shift" => Key::Shift,
            "control" => Key::Control,
            "alt" => Key::Alt,
            "pause" => Key::Pause,
            "escape" => Key::Escape,
            "space" => Key::Space,
            "pageup" => Key::PageUp,
            "pagedown" => Key::PageDown,
            "end" => Key::End,
            "home" => Key::Home,
            "left" => Key::LeftArrow,
            "up" => Key::UpArrow,
            "right" => Key::RightArrow,
            "down" => Key::DownArrow,
            "insert" => Key::Insert,
            "delete" => Key::Delete,
            "numpad_0" => Key::Numpad0,
            "numpad_1" => Key::Numpad1,
            "numpad_2" => Key::Numpad2,
            "numpad_3" => Key::Numpad3,
            "numpad_4" => Key::Numpad4,
            "numpad_5" => Key::Numpad5,
            "numpad_6" => Key::Numpad6,
            "numpad_7" => Key::Numpad7,
            "numpad_8" => Key::Numpad8,
            "numpad_9" => Key::Numpad9,
            "f1" => Key::F1,
            "f2" => Key::F2,
            "f3" => Key::F3,
            "f4" => Key::F4,
            "f5" => Key::F5,
            "f6" => Key::F6,
            "f7" => Key::F7,
            "f8" => Key::F8,
            "f9" => Key::F9,
            "f10" => Key::F10,
            "f11" => Key::F11,
            "f12" => Key::F12,
            "command" => Key::Meta,
            other => match single_char(other) {
                Some(c) => Key::Unicode(c),
                None => return Err(KeyError::InvalidKeyCode.into()),
            },
        };
        Ok(key)
    }
}
