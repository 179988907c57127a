//! Translation of local key events into the bytes a remote shell expects.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Returns true for the key that ends the client (`Ctrl-]`).
pub fn is_detach_key(key: &KeyEvent) -> bool {
    key.kind != KeyEventKind::Release
        && key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char(']') | KeyCode::Char('5'))
}

/// Encode a key press as terminal input.
///
/// Returns None for releases and keys with no VT encoding here.
pub fn encode_key(key: KeyEvent) -> Option<Vec<u8>> {
    if key.kind == KeyEventKind::Release {
        return None;
    }

    match key.code {
        KeyCode::Char(ch) => {
            let bytes = if key.modifiers.contains(KeyModifiers::CONTROL) {
                control_byte(ch).map(|b| vec![b]).unwrap_or_else(|| utf8(ch))
            } else {
                utf8(ch)
            };
            Some(alt_prefixed(key.modifiers, bytes))
        }
        KeyCode::Enter => Some(alt_prefixed(key.modifiers, vec![b'\r'])),
        KeyCode::Tab if key.modifiers.contains(KeyModifiers::SHIFT) => Some(b"\x1b[Z".to_vec()),
        KeyCode::Tab => Some(alt_prefixed(key.modifiers, vec![b'\t'])),
        KeyCode::BackTab => Some(b"\x1b[Z".to_vec()),
        KeyCode::Backspace => Some(alt_prefixed(key.modifiers, vec![0x7f])),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => Some(cursor_key(key.modifiers, 'A')),
        KeyCode::Down => Some(cursor_key(key.modifiers, 'B')),
        KeyCode::Right => Some(cursor_key(key.modifiers, 'C')),
        KeyCode::Left => Some(cursor_key(key.modifiers, 'D')),
        KeyCode::Home => Some(cursor_key(key.modifiers, 'H')),
        KeyCode::End => Some(cursor_key(key.modifiers, 'F')),
        KeyCode::Insert => Some(tilde_key(key.modifiers, 2)),
        KeyCode::Delete => Some(tilde_key(key.modifiers, 3)),
        KeyCode::PageUp => Some(tilde_key(key.modifiers, 5)),
        KeyCode::PageDown => Some(tilde_key(key.modifiers, 6)),
        KeyCode::F(n) => function_key(key.modifiers, n),
        _ => None,
    }
}

fn utf8(ch: char) -> Vec<u8> {
    let mut buffer = [0u8; 4];
    ch.encode_utf8(&mut buffer).as_bytes().to_vec()
}

fn control_byte(ch: char) -> Option<u8> {
    match ch.to_ascii_lowercase() {
        c @ 'a'..='z' => Some(c as u8 - b'a' + 1),
        ' ' | '@' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '7' | '/' => Some(0x1f),
        _ => None,
    }
}

fn alt_prefixed(modifiers: KeyModifiers, bytes: Vec<u8>) -> Vec<u8> {
    if !modifiers.contains(KeyModifiers::ALT) {
        return bytes;
    }
    let mut prefixed = Vec::with_capacity(bytes.len() + 1);
    prefixed.push(0x1b);
    prefixed.extend(bytes);
    prefixed
}

/// xterm modifier parameter: 1 + shift + 2*alt + 4*ctrl.
fn modifier_param(modifiers: KeyModifiers) -> Option<u8> {
    let mut value = 1;
    if modifiers.contains(KeyModifiers::SHIFT) {
        value += 1;
    }
    if modifiers.contains(KeyModifiers::ALT) {
        value += 2;
    }
    if modifiers.contains(KeyModifiers::CONTROL) {
        value += 4;
    }
    (value > 1).then_some(value)
}

fn cursor_key(modifiers: KeyModifiers, final_char: char) -> Vec<u8> {
    match modifier_param(modifiers) {
        Some(param) => format!("\x1b[1;{}{}", param, final_char).into_bytes(),
        None => format!("\x1b[{}", final_char).into_bytes(),
    }
}

fn tilde_key(modifiers: KeyModifiers, code: u8) -> Vec<u8> {
    match modifier_param(modifiers) {
        Some(param) => format!("\x1b[{};{}~", code, param).into_bytes(),
        None => format!("\x1b[{}~", code).into_bytes(),
    }
}

fn function_key(modifiers: KeyModifiers, n: u8) -> Option<Vec<u8>> {
    // F1-F4 use SS3 without modifiers
    let ss3 = match n {
        1 => Some('P'),
        2 => Some('Q'),
        3 => Some('R'),
        4 => Some('S'),
        _ => None,
    };
    if let Some(final_char) = ss3 {
        return Some(match modifier_param(modifiers) {
            Some(param) => format!("\x1b[1;{}{}", param, final_char).into_bytes(),
            None => format!("\x1bO{}", final_char).into_bytes(),
        });
    }

    let code = match n {
        5 => 15,
        6 => 17,
        7 => 18,
        8 => 19,
        9 => 20,
        10 => 21,
        11 => 23,
        12 => 24,
        _ => return None,
    };
    Some(tilde_key(modifiers, code))
}
