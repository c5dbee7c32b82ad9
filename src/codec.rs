use super::*;

pub(super) const ID_DELIMITER: char = '\u{1e}';
const ID_SEPARATOR: &str = "\u{1e}";
const LEGACY_DELIMITERS: [char; 2] = ['\u{0}', ','];
const INLINE_TAG: &str = "in";
const REF_TAG: &str = "ref";
const TRUNCATION_MARK: char = '…';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct FrameLimits {
    pub(super) identifier_max_bytes: usize,
    pub(super) max_buttons: usize,
    pub(super) max_content_chars: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            identifier_max_bytes: DEFAULT_IDENTIFIER_MAX_BYTES,
            max_buttons: DEFAULT_MAX_BUTTONS,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
        }
    }
}

/// Decoded button identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Identifier {
    /// Configuration and state travel inside the identifier itself.
    Inline {
        command_id: String,
        action: String,
        config: String,
        state: Option<String>,
    },
    /// Only the configuration uuid travels; everything else is in the store.
    Ref {
        command_id: String,
        action: String,
        config_uuid: Uuid,
    },
    /// Positional identifier from before the record separator was introduced.
    Legacy {
        command_id: String,
        action: String,
        fields: Vec<String>,
    },
}

impl Identifier {
    pub(super) fn command_id(&self) -> &str {
        match self {
            Identifier::Inline { command_id, .. }
            | Identifier::Ref { command_id, .. }
            | Identifier::Legacy { command_id, .. } => command_id,
        }
    }

    pub(super) fn action(&self) -> &str {
        match self {
            Identifier::Inline { action, .. }
            | Identifier::Ref { action, .. }
            | Identifier::Legacy { action, .. } => action,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(super) enum CodecError {
    #[error("malformed identifier '{0}'")]
    MalformedIdentifier(String),
    #[error("{field} '{value}' contains a reserved delimiter")]
    ReservedDelimiter { field: &'static str, value: String },
    #[error("identifier needs {len} bytes even by reference, ceiling is {max}")]
    IdentifierTooLong { len: usize, max: usize },
    #[error("layout has {count} buttons, at most {max} are allowed")]
    TooManyButtons { count: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct EncodedButton {
    pub(super) label: String,
    pub(super) identifier: String,
}

/// A layout ready to hand to the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct EncodedMessage {
    pub(super) content: String,
    pub(super) rows: Vec<Vec<EncodedButton>>,
    pub(super) by_reference: bool,
}

impl EncodedMessage {
    pub(super) fn text(content: &str, limits: &FrameLimits) -> Self {
        Self {
            content: truncate_content(content, limits.max_content_chars),
            rows: Vec::new(),
            by_reference: false,
        }
    }

    #[cfg(test)]
    pub(super) fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .flatten()
            .map(|button| button.identifier.as_str())
    }
}

pub(super) fn encode_inline(
    command_id: &str,
    action: &str,
    config: &str,
    state: Option<&str>,
) -> Result<String, CodecError> {
    check_field("command id", command_id)?;
    check_field("action", action)?;
    check_field("config", config)?;
    if let Some(state) = state {
        check_field("state", state)?;
    }
    Ok([
        command_id,
        action,
        INLINE_TAG,
        config,
        state.unwrap_or_default(),
    ]
    .join(ID_SEPARATOR))
}

pub(super) fn encode_ref(command_id: &str, action: &str, config_uuid: Uuid) -> Result<String, CodecError> {
    check_field("command id", command_id)?;
    check_field("action", action)?;
    let uuid = config_uuid.simple().to_string();
    Ok([command_id, action, REF_TAG, uuid.as_str()].join(ID_SEPARATOR))
}

/// Encodes one identifier, falling back to the reference form when the
/// inline form does not fit the byte ceiling.
pub(super) fn encode(
    command_id: &str,
    action: &str,
    config: &str,
    state: Option<&str>,
    config_uuid: Uuid,
    limits: &FrameLimits,
) -> Result<String, CodecError> {
    let inline = encode_inline(command_id, action, config, state)?;
    if inline.len() <= limits.identifier_max_bytes {
        return Ok(inline);
    }
    encode_ref_checked(command_id, action, config_uuid, limits)
}

fn encode_ref_checked(
    command_id: &str,
    action: &str,
    config_uuid: Uuid,
    limits: &FrameLimits,
) -> Result<String, CodecError> {
    let by_ref = encode_ref(command_id, action, config_uuid)?;
    if by_ref.len() > limits.identifier_max_bytes {
        return Err(CodecError::IdentifierTooLong {
            len: by_ref.len(),
            max: limits.identifier_max_bytes,
        });
    }
    Ok(by_ref)
}

/// Encodes every button of a layout. If any button overflows inline, the
/// whole message switches to reference identifiers so that the store holds
/// the single copy of the element state.
pub(super) fn encode_layout(
    command_id: &str,
    config_uuid: Uuid,
    config: &str,
    state: Option<&str>,
    layout: &MessageLayout,
    limits: &FrameLimits,
) -> Result<EncodedMessage, CodecError> {
    let count = layout.button_count();
    if count > limits.max_buttons {
        return Err(CodecError::TooManyButtons {
            count,
            max: limits.max_buttons,
        });
    }

    let mut inline_rows = Vec::with_capacity(layout.rows.len());
    let mut overflow = false;
    for row in &layout.rows {
        let mut encoded = Vec::with_capacity(row.len());
        for button in row {
            let identifier = encode_inline(command_id, &button.action, config, state)?;
            overflow |= identifier.len() > limits.identifier_max_bytes;
            encoded.push(EncodedButton {
                label: button.label.clone(),
                identifier,
            });
        }
        inline_rows.push(encoded);
    }

    let content = truncate_content(&layout.content, limits.max_content_chars);
    if !overflow {
        return Ok(EncodedMessage {
            content,
            rows: inline_rows,
            by_reference: false,
        });
    }

    let mut rows = Vec::with_capacity(layout.rows.len());
    for row in &layout.rows {
        let mut encoded = Vec::with_capacity(row.len());
        for button in row {
            encoded.push(EncodedButton {
                label: button.label.clone(),
                identifier: encode_ref_checked(command_id, &button.action, config_uuid, limits)?,
            });
        }
        rows.push(encoded);
    }
    Ok(EncodedMessage {
        content,
        rows,
        by_reference: true,
    })
}

/// Decodes a raw identifier. The current format is tried first, then the
/// legacy positional one.
pub(super) fn decode(raw: &str) -> Result<Identifier, CodecError> {
    decode_current(raw)
        .or_else(|| decode_legacy(raw))
        .unwrap_or_else(|| Err(CodecError::MalformedIdentifier(printable(raw))))
}

fn decode_current(raw: &str) -> Option<Result<Identifier, CodecError>> {
    if !raw.contains(ID_DELIMITER) {
        return None;
    }
    let malformed = || CodecError::MalformedIdentifier(printable(raw));
    let parts: Vec<&str> = raw.split(ID_DELIMITER).collect();
    let parsed = match parts.as_slice() {
        [command_id, action, tag, config, state] if *tag == INLINE_TAG => {
            if command_id.is_empty() || action.is_empty() {
                return Some(Err(malformed()));
            }
            Identifier::Inline {
                command_id: command_id.to_string(),
                action: action.to_string(),
                config: config.to_string(),
                state: (!state.is_empty()).then(|| state.to_string()),
            }
        }
        [command_id, action, tag, uuid] if *tag == REF_TAG => {
            if command_id.is_empty() || action.is_empty() {
                return Some(Err(malformed()));
            }
            let Ok(config_uuid) = Uuid::parse_str(uuid) else {
                return Some(Err(malformed()));
            };
            Identifier::Ref {
                command_id: command_id.to_string(),
                action: action.to_string(),
                config_uuid,
            }
        }
        _ => return Some(Err(malformed())),
    };
    Some(Ok(parsed))
}

fn decode_legacy(raw: &str) -> Option<Result<Identifier, CodecError>> {
    let delimiter = LEGACY_DELIMITERS
        .iter()
        .copied()
        .find(|delimiter| raw.contains(*delimiter))?;
    let mut parts = raw.split(delimiter).map(str::to_string);
    let command_id = parts.next().unwrap_or_default();
    let action = parts.next().unwrap_or_default();
    if command_id.is_empty() || action.is_empty() {
        return Some(Err(CodecError::MalformedIdentifier(printable(raw))));
    }
    Some(Ok(Identifier::Legacy {
        command_id,
        action,
        fields: parts.collect(),
    }))
}

fn check_field(field: &'static str, value: &str) -> Result<(), CodecError> {
    if value.contains(ID_DELIMITER) {
        return Err(CodecError::ReservedDelimiter {
            field,
            value: printable(value),
        });
    }
    Ok(())
}

pub(super) fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut truncated: String = content.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push(TRUNCATION_MARK);
    truncated
}

/// Identifier rendered for logs, with delimiters made visible.
pub(super) fn printable(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ID_DELIMITER => '|',
            '\u{0}' => '.',
            other => other,
        })
        .collect()
}
