use super::*;

use rand::Rng;

const MAX_DICE_PER_TERM: u32 = 1_000;
const MAX_DIE_SIDES: u32 = 1_000;

/// Immutable per-invocation settings of a command.
pub(super) trait CommandConfig: Persisted + Clone + Debug + Send + Sync + 'static {
    /// Short form carried inside inline identifiers.
    fn compact(&self) -> String;
    fn from_compact(raw: &str) -> Option<Self>;
}

/// Mutable per-element selection of a command.
pub(super) trait CommandState: Persisted + Clone + Debug + Send + Sync + 'static {
    fn compact(&self) -> String;
    fn from_compact(raw: &str) -> Option<Self>;

    /// User that made the first selection, if the command tracks it.
    fn started_by(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ButtonSpec {
    pub(super) label: String,
    pub(super) action: String,
}

impl ButtonSpec {
    pub(super) fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
        }
    }
}

/// What an element looks like before identifiers are encoded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(super) struct MessageLayout {
    pub(super) content: String,
    pub(super) rows: Vec<Vec<ButtonSpec>>,
}

impl MessageLayout {
    pub(super) fn button_count(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Lays buttons out in rows of at most `per_row`.
    pub(super) fn with_buttons(content: impl Into<String>, buttons: Vec<ButtonSpec>, per_row: usize) -> Self {
        let rows = buttons
            .chunks(per_row.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        Self {
            content: content.into(),
            rows,
        }
    }

    pub(super) fn push_row(mut self, row: Vec<ButtonSpec>) -> Self {
        if !row.is_empty() {
            self.rows.push(row);
        }
        self
    }
}

pub(super) enum Step<S> {
    /// Selection changed; the element stays interactive.
    Continue(S),
    /// Selection is complete; an answer is produced.
    Finish(S),
    /// The click does not apply to the current selection.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Answer {
    pub(super) expression: String,
    pub(super) result: String,
    pub(super) details: String,
}

impl Answer {
    pub(super) fn render(&self, user_name: &str) -> String {
        let mut text = format!("{} rolled {}: {}", user_name, self.expression, self.result);
        if !self.details.is_empty() {
            text.push('\n');
            text.push_str(&self.details);
        }
        text
    }
}

/// Who clicked.
pub(super) struct ClickContext {
    pub(super) user_id: u64,
}

/// A button-driven command. Implementations are pure: persistence,
/// rendering and cleanup are handled by the resolver.
pub(super) trait InteractiveCommand: Send + Sync + 'static {
    type Config: CommandConfig;
    type State: CommandState;

    fn command_id(&self) -> &'static str;

    /// Whether the state is recovered from the element content instead of
    /// being carried in the button identifiers.
    fn state_in_content(&self) -> bool {
        false
    }

    fn state_from_content(&self, _config: &Self::Config, _content: &str) -> Option<Self::State> {
        None
    }

    /// Rebuilds configuration and state from a positional legacy identifier.
    fn from_legacy(&self, _fields: &[String]) -> Option<(Self::Config, Option<Self::State>)> {
        None
    }

    fn apply(
        &self,
        config: &Self::Config,
        state: Option<&Self::State>,
        action: &str,
        click: &ClickContext,
    ) -> Step<Self::State>;

    /// Layout for the given state; `None` is the initial layout.
    fn layout(&self, config: &Self::Config, state: Option<&Self::State>) -> MessageLayout;

    fn answer(
        &self,
        config: &Self::Config,
        state: &Self::State,
        dice: &dyn DiceEvaluator,
    ) -> std::result::Result<Answer, EvalError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Roll {
    pub(super) total: i64,
    pub(super) dice: Vec<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(super) enum EvalError {
    #[error("invalid dice expression '{0}'")]
    Invalid(String),
    #[error("'{0}' asks for too many dice or sides")]
    TooLarge(String),
}

pub(super) trait DiceEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str) -> std::result::Result<Roll, EvalError>;

    fn roll_die(&self, sides: u32) -> std::result::Result<u32, EvalError> {
        let roll = self.evaluate(&format!("1d{}", sides))?;
        roll.dice
            .first()
            .copied()
            .ok_or_else(|| EvalError::Invalid(format!("1d{}", sides)))
    }
}

/// Evaluates sums of `NdS` terms and integer modifiers with a thread rng.
pub(super) struct RandomDice;

impl DiceEvaluator for RandomDice {
    fn evaluate(&self, expression: &str) -> std::result::Result<Roll, EvalError> {
        let mut rng = rand::thread_rng();
        evaluate_with(expression, |sides| rng.gen_range(1..=sides))
    }
}

pub(super) fn evaluate_with<F>(expression: &str, mut roll: F) -> std::result::Result<Roll, EvalError>
where
    F: FnMut(u32) -> u32,
{
    let invalid = || EvalError::Invalid(expression.to_string());
    let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(invalid());
    }

    let mut total: i64 = 0;
    let mut dice = Vec::new();
    for (sign, term) in split_terms(&compact) {
        if term.is_empty() {
            return Err(invalid());
        }
        let value = match term.split_once(['d', 'D']) {
            Some((count, sides)) => {
                let count: u32 = if count.is_empty() {
                    1
                } else {
                    count.parse().map_err(|_| invalid())?
                };
                let sides: u32 = sides.parse().map_err(|_| invalid())?;
                if sides == 0 || count == 0 {
                    return Err(invalid());
                }
                if count > MAX_DICE_PER_TERM || sides > MAX_DIE_SIDES {
                    return Err(EvalError::TooLarge(expression.to_string()));
                }
                let mut sum: i64 = 0;
                for _ in 0..count {
                    let face = roll(sides);
                    dice.push(face);
                    sum += i64::from(face);
                }
                sum
            }
            None => term.parse::<i64>().map_err(|_| invalid())?,
        };
        total += sign * value;
    }
    Ok(Roll { total, dice })
}

fn split_terms(expression: &str) -> Vec<(i64, &str)> {
    let mut terms = Vec::new();
    let mut sign = 1;
    let mut start = 0;
    for (index, c) in expression.char_indices() {
        if c == '+' || c == '-' {
            if index > 0 {
                terms.push((sign, &expression[start..index]));
            }
            sign = if c == '-' { -1 } else { 1 };
            start = index + 1;
        }
    }
    terms.push((sign, &expression[start..]));
    terms
}
