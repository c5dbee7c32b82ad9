use super::*;

const COMMAND_ID: &str = "pool_target";
const CLEAR: &str = "clear";
const DO_REROLL: &str = "do_reroll";
const NO_REROLL: &str = "no_reroll";
const BUTTONS_PER_ROW: usize = 5;
const MAX_REROLLS: usize = 100;
pub(super) const MAX_POOL_BUTTONS: u32 = 25;
pub(super) const MAX_SIDES: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(super) enum RerollVariant {
    /// Reroll without asking once pool and target are chosen.
    #[default]
    #[serde(alias = "ALWAYS")]
    Always,
    /// Ask whether to reroll after the target is chosen.
    #[serde(alias = "ASK")]
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct PoolTargetConfig {
    #[serde(alias = "diceSides")]
    pub(super) sides: u32,
    #[serde(alias = "maxNumberOfButtons")]
    pub(super) max_dice: u32,
    #[serde(default, alias = "rerollSet")]
    pub(super) reroll_set: BTreeSet<u32>,
    #[serde(default, alias = "botchSet")]
    pub(super) botch_set: BTreeSet<u32>,
    #[serde(default, alias = "rerollVariant")]
    pub(super) reroll_variant: RerollVariant,
}

impl PoolTargetConfig {
    pub(super) fn validate(&self) -> Result<()> {
        if self.sides < 2 || self.sides > MAX_SIDES {
            bail!("sides must be between 2 and {}", MAX_SIDES);
        }
        if self.max_dice < 1 || self.max_dice > MAX_POOL_BUTTONS {
            bail!("max dice must be between 1 and {}", MAX_POOL_BUTTONS);
        }
        if self.reroll_set.len() as u32 >= self.sides {
            bail!("the reroll set must leave at least one face that is not rerolled");
        }
        if let Some(face) = self
            .reroll_set
            .iter()
            .chain(self.botch_set.iter())
            .find(|face| **face == 0 || **face > self.sides)
        {
            bail!("face {} is not on a d{}", face, self.sides);
        }
        Ok(())
    }

    /// Parses `/pool_target <sides> <max dice> [reroll faces] [botch faces] [ask|always]`,
    /// with face lists comma separated.
    pub(super) fn parse_args(args: &[&str]) -> Result<Self> {
        let sides = args
            .first()
            .context("missing number of sides")?
            .parse()
            .context("sides must be a number")?;
        let max_dice = match args.get(1) {
            Some(raw) => raw.parse().context("max dice must be a number")?,
            None => 15,
        };
        let reroll_set = parse_faces(args.get(2).copied().unwrap_or_default())?;
        let botch_set = parse_faces(args.get(3).copied().unwrap_or_default())?;
        let reroll_variant = match args.get(4).map(|raw| raw.to_ascii_lowercase()) {
            None => RerollVariant::Always,
            Some(raw) if raw == "always" => RerollVariant::Always,
            Some(raw) if raw == "ask" => RerollVariant::Ask,
            Some(raw) => bail!("unknown reroll variant '{}'", raw),
        };
        let config = Self {
            sides,
            max_dice,
            reroll_set,
            botch_set,
            reroll_variant,
        };
        config.validate()?;
        Ok(config)
    }

    fn ask_for_reroll(&self) -> bool {
        self.reroll_variant == RerollVariant::Ask && !self.reroll_set.is_empty()
    }

    fn description(&self) -> String {
        let mut parts = Vec::new();
        if !self.reroll_set.is_empty() {
            parts.push(format!("reroll {}", join_faces(&self.reroll_set, ",")));
        }
        if !self.botch_set.is_empty() {
            parts.push(format!("botch {}", join_faces(&self.botch_set, ",")));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!(" ({})", parts.join(", "))
        }
    }
}

impl Persisted for PoolTargetConfig {
    const TYPE_TAG: &'static str = "PoolTargetConfigV2";
    const PRIOR_TYPE_TAGS: &'static [&'static str] = &["PoolTargetConfig"];
}

impl CommandConfig for PoolTargetConfig {
    fn compact(&self) -> String {
        let variant = match self.reroll_variant {
            RerollVariant::Always => "a",
            RerollVariant::Ask => "q",
        };
        format!(
            "{}.{}.{}.{}.{}",
            self.sides,
            self.max_dice,
            join_faces(&self.reroll_set, ";"),
            join_faces(&self.botch_set, ";"),
            variant
        )
    }

    fn from_compact(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        let [sides, max_dice, reroll, botch, variant] = parts.as_slice() else {
            return None;
        };
        let reroll_variant = match *variant {
            "a" => RerollVariant::Always,
            "q" => RerollVariant::Ask,
            _ => return None,
        };
        let config = Self {
            sides: sides.parse().ok()?,
            max_dice: max_dice.parse().ok()?,
            reroll_set: parse_faces(reroll).ok()?,
            botch_set: parse_faces(botch).ok()?,
            reroll_variant,
        };
        config.validate().ok()?;
        Some(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub(super) struct PoolTargetState {
    #[serde(default, alias = "dicePool")]
    pub(super) pool: Option<u32>,
    #[serde(default, alias = "targetNumber")]
    pub(super) target: Option<u32>,
    #[serde(default, alias = "doReroll")]
    pub(super) do_reroll: Option<bool>,
    #[serde(default)]
    pub(super) started_by: Option<u64>,
}

impl Persisted for PoolTargetState {
    const TYPE_TAG: &'static str = "PoolTargetStateV2";
    const PRIOR_TYPE_TAGS: &'static [&'static str] = &["PoolTargetStateData"];
}

impl CommandState for PoolTargetState {
    fn compact(&self) -> String {
        let reroll = match self.do_reroll {
            Some(true) => "y".to_string(),
            Some(false) => "n".to_string(),
            None => String::new(),
        };
        format!(
            "{}.{}.{}.{}",
            optional(self.pool),
            optional(self.target),
            reroll,
            optional(self.started_by)
        )
    }

    fn from_compact(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        let [pool, target, reroll, started_by] = parts.as_slice() else {
            return None;
        };
        let do_reroll = match *reroll {
            "" => None,
            "y" => Some(true),
            "n" => Some(false),
            _ => return None,
        };
        Some(Self {
            pool: parse_optional(pool)?,
            target: parse_optional(target)?,
            do_reroll,
            started_by: parse_optional(started_by)?,
        })
    }

    fn started_by(&self) -> Option<u64> {
        self.started_by
    }
}

impl PoolTargetState {
    /// Whether the selection could have been made with `config`'s buttons.
    fn fits(&self, config: &PoolTargetConfig) -> bool {
        self.pool.map_or(true, |pool| (1..=config.max_dice).contains(&pool))
            && self.target.map_or(true, |target| (2..=config.sides).contains(&target))
    }
}

/// Rolls a pool of dice against a target number, counting successes minus
/// botches, with an optional exploding reroll of chosen faces.
pub(super) struct PoolTargetCommand;

impl InteractiveCommand for PoolTargetCommand {
    type Config = PoolTargetConfig;
    type State = PoolTargetState;

    fn command_id(&self) -> &'static str {
        COMMAND_ID
    }

    fn from_legacy(&self, fields: &[String]) -> Option<(Self::Config, Option<Self::State>)> {
        let field = |index: usize| fields.get(index).map(String::as_str).unwrap_or_default();
        let reroll_variant = match field(4).to_ascii_lowercase().as_str() {
            "ask" => RerollVariant::Ask,
            _ => RerollVariant::Always,
        };
        let config = PoolTargetConfig {
            sides: field(0).parse().ok()?,
            max_dice: field(1).parse().ok()?,
            reroll_set: parse_faces(field(2)).ok()?,
            botch_set: parse_faces(field(3)).ok()?,
            reroll_variant,
        };
        config.validate().ok()?;
        let state = PoolTargetState {
            pool: field(5).parse().ok(),
            target: field(6).parse().ok(),
            do_reroll: None,
            started_by: None,
        };
        let state = (state.pool.is_some()).then_some(state);
        Some((config, state))
    }

    fn apply(
        &self,
        config: &Self::Config,
        state: Option<&Self::State>,
        action: &str,
        click: &ClickContext,
    ) -> Step<Self::State> {
        if action == CLEAR {
            return Step::Continue(PoolTargetState::default());
        }
        let current = match state {
            Some(state) if state.fits(config) => state.clone(),
            Some(state) => {
                debug!("dropping selection {} outside of {}", state.compact(), config.compact());
                PoolTargetState::default()
            }
            None => PoolTargetState::default(),
        };
        let number = action.parse::<u32>().ok();
        match (current.pool, current.target, number) {
            (None, _, Some(pool)) if (1..=config.max_dice).contains(&pool) => Step::Continue(PoolTargetState {
                pool: Some(pool),
                target: None,
                do_reroll: None,
                started_by: Some(click.user_id),
            }),
            (Some(_), None, Some(target)) if (2..=config.sides).contains(&target) => {
                let next = PoolTargetState {
                    target: Some(target),
                    ..current
                };
                if config.ask_for_reroll() {
                    Step::Continue(next)
                } else {
                    Step::Finish(PoolTargetState {
                        do_reroll: Some(!config.reroll_set.is_empty()),
                        ..next
                    })
                }
            }
            (Some(_), Some(_), None) if action == DO_REROLL || action == NO_REROLL => Step::Finish(PoolTargetState {
                do_reroll: Some(action == DO_REROLL),
                ..current
            }),
            _ => Step::Ignore,
        }
    }

    fn layout(&self, config: &Self::Config, state: Option<&Self::State>) -> MessageLayout {
        let pool = state.and_then(|s| s.pool);
        let target = state.and_then(|s| s.target);
        match (pool, target) {
            (Some(pool), None) => {
                let buttons = (2..=config.sides)
                    .map(|target| ButtonSpec::new(format!("{}", target), target.to_string()))
                    .collect();
                MessageLayout::with_buttons(
                    format!(
                        "Click on the target to roll {}d{} against it{}",
                        pool,
                        config.sides,
                        config.description()
                    ),
                    buttons,
                    BUTTONS_PER_ROW,
                )
                .push_row(vec![ButtonSpec::new("Clear", CLEAR)])
            }
            (Some(pool), Some(target)) => MessageLayout {
                content: format!(
                    "Should {} in {}d{} against {} be rerolled?",
                    join_faces(&config.reroll_set, ","),
                    pool,
                    config.sides,
                    target
                ),
                rows: vec![vec![
                    ButtonSpec::new("Reroll", DO_REROLL),
                    ButtonSpec::new("No reroll", NO_REROLL),
                    ButtonSpec::new("Clear", CLEAR),
                ]],
            },
            (None, _) => {
                let buttons = (1..=config.max_dice)
                    .map(|count| ButtonSpec::new(format!("{}d{}", count, config.sides), count.to_string()))
                    .collect();
                MessageLayout::with_buttons(
                    format!("Click on the buttons to roll dice{}", config.description()),
                    buttons,
                    BUTTONS_PER_ROW,
                )
            }
        }
    }

    fn answer(
        &self,
        config: &Self::Config,
        state: &Self::State,
        dice: &dyn DiceEvaluator,
    ) -> std::result::Result<Answer, EvalError> {
        let (Some(pool), Some(target)) = (state.pool, state.target) else {
            return Err(EvalError::Invalid(state.compact()));
        };
        let mut faces = dice.evaluate(&format!("{}d{}", pool, config.sides))?.dice;
        if state.do_reroll.unwrap_or(false) {
            let mut pending = faces.iter().filter(|face| config.reroll_set.contains(*face)).count();
            let mut rerolled = 0;
            while pending > 0 && rerolled < MAX_REROLLS {
                let face = dice.roll_die(config.sides)?;
                faces.push(face);
                rerolled += 1;
                pending -= 1;
                if config.reroll_set.contains(&face) {
                    pending += 1;
                }
            }
        }
        let successes = faces.iter().filter(|face| **face >= target).count() as i64;
        let botches = faces.iter().filter(|face| config.botch_set.contains(*face)).count() as i64;
        let reroll_note = if state.do_reroll.unwrap_or(false) && !config.reroll_set.is_empty() {
            format!(" reroll {}", join_faces(&config.reroll_set, ","))
        } else {
            String::new()
        };
        Ok(Answer {
            expression: format!("{}d{} ≥{}{}", pool, config.sides, target, reroll_note),
            result: (successes - botches).to_string(),
            details: format!(
                "[{}]",
                faces.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
            ),
        })
    }
}

fn parse_faces(raw: &str) -> Result<BTreeSet<u32>> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().with_context(|| format!("'{}' is not a die face", part)))
        .collect()
}

fn join_faces(faces: &BTreeSet<u32>, separator: &str) -> String {
    faces
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_optional<T: std::str::FromStr>(raw: &str) -> Option<Option<T>> {
    if raw.is_empty() {
        return Some(None);
    }
    raw.parse().ok().map(Some)
}
