use super::*;

const COMMAND_ID: &str = "sum_dice";
const ROLL: &str = "roll";
const CLEAR: &str = "clear";
const PLUS_ONE: &str = "+1";
const MINUS_ONE: &str = "-1";
const EXPRESSION_PREFIX: &str = "Expression: ";
const EMPTY_PROMPT: &str = "Click the buttons to build a roll";
const MAX_EXPRESSION_CHARS: usize = 120;
const BUTTONS_PER_ROW: usize = 4;
const DEFAULT_DICE: [u32; 6] = [4, 6, 8, 10, 12, 20];
const MAX_SIDES: u32 = 100;
const MAX_DISTINCT_DICE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct SumDiceConfig {
    #[serde(alias = "diceSides")]
    pub(super) dice: Vec<u32>,
}

impl Default for SumDiceConfig {
    fn default() -> Self {
        Self {
            dice: DEFAULT_DICE.to_vec(),
        }
    }
}

impl SumDiceConfig {
    pub(super) fn parse_args(args: &[&str]) -> Result<Self> {
        if args.is_empty() {
            return Ok(Self::default());
        }
        let mut dice = Vec::with_capacity(args.len());
        for raw in args {
            let sides: u32 = raw
                .trim_start_matches(['d', 'D'])
                .parse()
                .with_context(|| format!("'{}' is not a die", raw))?;
            if !dice.contains(&sides) {
                dice.push(sides);
            }
        }
        let config = Self { dice };
        config.validate()?;
        Ok(config)
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.dice.is_empty() {
            bail!("at least one die is required");
        }
        if let Some(sides) = self.dice.iter().find(|sides| !(2..=MAX_SIDES).contains(*sides)) {
            bail!("d{} is not supported", sides);
        }
        if self.dice.len() > MAX_DISTINCT_DICE {
            bail!("at most {} different dice are supported", MAX_DISTINCT_DICE);
        }
        Ok(())
    }
}

impl Persisted for SumDiceConfig {
    const TYPE_TAG: &'static str = "SumDiceConfigV2";
    const PRIOR_TYPE_TAGS: &'static [&'static str] = &["SumDiceConfig"];
}

impl CommandConfig for SumDiceConfig {
    fn compact(&self) -> String {
        self.dice
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    fn from_compact(raw: &str) -> Option<Self> {
        let dice = raw
            .split('.')
            .map(|part| part.parse().ok())
            .collect::<Option<Vec<u32>>>()?;
        let config = Self { dice };
        config.validate().ok()?;
        Some(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct SumDiceState {
    pub(super) expression: String,
}

impl Persisted for SumDiceState {
    const TYPE_TAG: &'static str = "SumDiceStateV2";
    const PRIOR_TYPE_TAGS: &'static [&'static str] = &["SumDiceStateData"];
}

impl CommandState for SumDiceState {
    fn compact(&self) -> String {
        self.expression.clone()
    }

    fn from_compact(raw: &str) -> Option<Self> {
        Some(Self {
            expression: raw.to_string(),
        })
    }
}

/// Builds a sum of dice and modifiers by clicking, keeping the expression
/// in the element content.
pub(super) struct SumDiceCommand;

impl InteractiveCommand for SumDiceCommand {
    type Config = SumDiceConfig;
    type State = SumDiceState;

    fn command_id(&self) -> &'static str {
        COMMAND_ID
    }

    fn state_in_content(&self) -> bool {
        true
    }

    fn state_from_content(&self, _config: &Self::Config, content: &str) -> Option<Self::State> {
        let expression = content.strip_prefix(EXPRESSION_PREFIX)?.trim();
        (!expression.is_empty()).then(|| SumDiceState {
            expression: expression.to_string(),
        })
    }

    fn from_legacy(&self, fields: &[String]) -> Option<(Self::Config, Option<Self::State>)> {
        let dice: Vec<&str> = fields
            .iter()
            .map(String::as_str)
            .filter(|field| !field.is_empty())
            .collect();
        let config = SumDiceConfig::parse_args(&dice).ok()?;
        Some((config, None))
    }

    fn apply(
        &self,
        config: &Self::Config,
        state: Option<&Self::State>,
        action: &str,
        _click: &ClickContext,
    ) -> Step<Self::State> {
        let current = state.map(|s| s.expression.as_str()).unwrap_or_default();
        match action {
            CLEAR => Step::Continue(SumDiceState {
                expression: String::new(),
            }),
            ROLL if !current.is_empty() => Step::Finish(SumDiceState {
                expression: current.to_string(),
            }),
            ROLL => Step::Ignore,
            _ => {
                let Some(term) = term_for_action(config, action) else {
                    return Step::Ignore;
                };
                let expression = append_term(current, &term);
                if expression.chars().count() > MAX_EXPRESSION_CHARS {
                    return Step::Ignore;
                }
                Step::Continue(SumDiceState { expression })
            }
        }
    }

    fn layout(&self, config: &Self::Config, state: Option<&Self::State>) -> MessageLayout {
        let content = match state {
            Some(state) if !state.expression.is_empty() => format!("{}{}", EXPRESSION_PREFIX, state.expression),
            _ => EMPTY_PROMPT.to_string(),
        };
        let buttons = config
            .dice
            .iter()
            .map(|sides| ButtonSpec::new(format!("+1d{}", sides), format!("d{}", sides)))
            .collect();
        MessageLayout::with_buttons(content, buttons, BUTTONS_PER_ROW).push_row(vec![
            ButtonSpec::new(PLUS_ONE, PLUS_ONE),
            ButtonSpec::new(MINUS_ONE, MINUS_ONE),
            ButtonSpec::new("Roll", ROLL),
            ButtonSpec::new("Clear", CLEAR),
        ])
    }

    fn answer(
        &self,
        _config: &Self::Config,
        state: &Self::State,
        dice: &dyn DiceEvaluator,
    ) -> std::result::Result<Answer, EvalError> {
        let roll = dice.evaluate(&state.expression)?;
        Ok(Answer {
            expression: state.expression.clone(),
            result: roll.total.to_string(),
            details: if roll.dice.is_empty() {
                String::new()
            } else {
                format!(
                    "[{}]",
                    roll.dice.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
                )
            },
        })
    }
}

fn term_for_action(config: &SumDiceConfig, action: &str) -> Option<String> {
    match action {
        PLUS_ONE => Some("+1".to_string()),
        MINUS_ONE => Some("-1".to_string()),
        _ => {
            let sides: u32 = action.strip_prefix('d')?.parse().ok()?;
            config
                .dice
                .contains(&sides)
                .then(|| format!("+1d{}", sides))
        }
    }
}

fn append_term(expression: &str, term: &str) -> String {
    if expression.is_empty() {
        term.trim_start_matches('+').to_string()
    } else {
        format!("{}{}", expression, term)
    }
}
