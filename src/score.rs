// score.rs - Score types and their weighted impacters

use rust_decimal::Decimal;
use std::fmt::{self, Debug, Display};
use std::ops::{Add, Sub};

/// Core trait for score types.
///
/// Scores form an additive group: `impact` adds a weighted delta, `undo`
/// subtracts the identical delta, and after both the total is exactly what
/// it was (components are integers or `Decimal`, never floats). The `init`
/// dimension counts uninitialized planning variables and dominates every
/// comparison.
pub trait Score:
    Clone + PartialEq + Eq + PartialOrd + Ord + Debug + Display + Add<Output = Self> + Sub<Output = Self> + 'static
{
    /// Weight-specialized impacter with zero-weight components elided.
    type Impacter: ScoreImpacter<Self>;

    /// Additive identity.
    fn zero() -> Self;

    fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// Attaches the uninitialized-variable count.
    fn with_init(self, init_score: i32) -> Self;

    fn init_score(&self) -> i32;

    /// Builds the impacter for a constraint weight. Called once per
    /// constraint at network build time.
    fn build_impacter(weight: &Self) -> Self::Impacter;

    /// A score is feasible when fully initialized and no hard level is negative.
    fn is_feasible(&self) -> bool;
}

/// Computes `weight * match_weight` for one constraint.
pub trait ScoreImpacter<S>: Debug + Clone {
    fn apply(&self, match_weight: i64) -> S;
}

// ---------------------------------------------------------------------------
// SimpleScore

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct SimpleScore {
    pub init: i32,
    pub score: i64,
}

impl SimpleScore {
    pub fn of(score: i64) -> Self {
        Self { init: 0, score }
    }
}

impl Add for SimpleScore {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            init: self.init + rhs.init,
            score: self.score + rhs.score,
        }
    }
}

impl Sub for SimpleScore {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            init: self.init - rhs.init,
            score: self.score - rhs.score,
        }
    }
}

impl Display for SimpleScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.init != 0 {
            write!(f, "{}init/", self.init)?;
        }
        write!(f, "{}", self.score)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimpleImpacter(i64);

impl ScoreImpacter<SimpleScore> for SimpleImpacter {
    fn apply(&self, match_weight: i64) -> SimpleScore {
        SimpleScore::of(self.0 * match_weight)
    }
}

impl Score for SimpleScore {
    type Impacter = SimpleImpacter;

    fn zero() -> Self {
        Self::default()
    }

    fn with_init(mut self, init_score: i32) -> Self {
        self.init = init_score;
        self
    }

    fn init_score(&self) -> i32 {
        self.init
    }

    fn build_impacter(weight: &Self) -> SimpleImpacter {
        SimpleImpacter(weight.score)
    }

    fn is_feasible(&self) -> bool {
        self.init == 0
    }
}

// ---------------------------------------------------------------------------
// HardSoftScore

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct HardSoftScore {
    pub init: i32,
    pub hard: i64,
    pub soft: i64,
}

impl HardSoftScore {
    pub fn of(hard: i64, soft: i64) -> Self {
        Self { init: 0, hard, soft }
    }

    pub fn of_hard(hard: i64) -> Self {
        Self::of(hard, 0)
    }

    pub fn of_soft(soft: i64) -> Self {
        Self::of(0, soft)
    }
}

impl Add for HardSoftScore {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            init: self.init + rhs.init,
            hard: self.hard + rhs.hard,
            soft: self.soft + rhs.soft,
        }
    }
}

impl Sub for HardSoftScore {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            init: self.init - rhs.init,
            hard: self.hard - rhs.hard,
            soft: self.soft - rhs.soft,
        }
    }
}

impl Display for HardSoftScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.init != 0 {
            write!(f, "{}init/", self.init)?;
        }
        write!(f, "{}hard/{}soft", self.hard, self.soft)
    }
}

/// Weight specialization: a constraint whose weight only touches one level
/// never computes the other.
#[derive(Debug, Clone, Copy)]
pub enum HardSoftImpacter {
    Hard(i64),
    Soft(i64),
    Both { hard: i64, soft: i64 },
}

impl ScoreImpacter<HardSoftScore> for HardSoftImpacter {
    fn apply(&self, match_weight: i64) -> HardSoftScore {
        match *self {
            HardSoftImpacter::Hard(hard) => HardSoftScore::of_hard(hard * match_weight),
            HardSoftImpacter::Soft(soft) => HardSoftScore::of_soft(soft * match_weight),
            HardSoftImpacter::Both { hard, soft } => {
                HardSoftScore::of(hard * match_weight, soft * match_weight)
            }
        }
    }
}

impl Score for HardSoftScore {
    type Impacter = HardSoftImpacter;

    fn zero() -> Self {
        Self::default()
    }

    fn with_init(mut self, init_score: i32) -> Self {
        self.init = init_score;
        self
    }

    fn init_score(&self) -> i32 {
        self.init
    }

    fn build_impacter(weight: &Self) -> HardSoftImpacter {
        match (weight.hard, weight.soft) {
            (hard, 0) => HardSoftImpacter::Hard(hard),
            (0, soft) => HardSoftImpacter::Soft(soft),
            (hard, soft) => HardSoftImpacter::Both { hard, soft },
        }
    }

    fn is_feasible(&self) -> bool {
        self.init == 0 && self.hard >= 0
    }
}

// ---------------------------------------------------------------------------
// HardMediumSoftScore

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct HardMediumSoftScore {
    pub init: i32,
    pub hard: i64,
    pub medium: i64,
    pub soft: i64,
}

impl HardMediumSoftScore {
    pub fn of(hard: i64, medium: i64, soft: i64) -> Self {
        Self {
            init: 0,
            hard,
            medium,
            soft,
        }
    }

    pub fn of_hard(hard: i64) -> Self {
        Self::of(hard, 0, 0)
    }

    pub fn of_medium(medium: i64) -> Self {
        Self::of(0, medium, 0)
    }

    pub fn of_soft(soft: i64) -> Self {
        Self::of(0, 0, soft)
    }
}

impl Add for HardMediumSoftScore {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            init: self.init + rhs.init,
            hard: self.hard + rhs.hard,
            medium: self.medium + rhs.medium,
            soft: self.soft + rhs.soft,
        }
    }
}

impl Sub for HardMediumSoftScore {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            init: self.init - rhs.init,
            hard: self.hard - rhs.hard,
            medium: self.medium - rhs.medium,
            soft: self.soft - rhs.soft,
        }
    }
}

impl Display for HardMediumSoftScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.init != 0 {
            write!(f, "{}init/", self.init)?;
        }
        write!(f, "{}hard/{}medium/{}soft", self.hard, self.medium, self.soft)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum HardMediumSoftImpacter {
    Hard(i64),
    Medium(i64),
    Soft(i64),
    Mixed { hard: i64, medium: i64, soft: i64 },
}

impl ScoreImpacter<HardMediumSoftScore> for HardMediumSoftImpacter {
    fn apply(&self, match_weight: i64) -> HardMediumSoftScore {
        match *self {
            HardMediumSoftImpacter::Hard(hard) => HardMediumSoftScore::of_hard(hard * match_weight),
            HardMediumSoftImpacter::Medium(medium) => {
                HardMediumSoftScore::of_medium(medium * match_weight)
            }
            HardMediumSoftImpacter::Soft(soft) => HardMediumSoftScore::of_soft(soft * match_weight),
            HardMediumSoftImpacter::Mixed { hard, medium, soft } => HardMediumSoftScore::of(
                hard * match_weight,
                medium * match_weight,
                soft * match_weight,
            ),
        }
    }
}

impl Score for HardMediumSoftScore {
    type Impacter = HardMediumSoftImpacter;

    fn zero() -> Self {
        Self::default()
    }

    fn with_init(mut self, init_score: i32) -> Self {
        self.init = init_score;
        self
    }

    fn init_score(&self) -> i32 {
        self.init
    }

    fn build_impacter(weight: &Self) -> HardMediumSoftImpacter {
        match (weight.hard, weight.medium, weight.soft) {
            (hard, 0, 0) => HardMediumSoftImpacter::Hard(hard),
            (0, medium, 0) => HardMediumSoftImpacter::Medium(medium),
            (0, 0, soft) => HardMediumSoftImpacter::Soft(soft),
            (hard, medium, soft) => HardMediumSoftImpacter::Mixed { hard, medium, soft },
        }
    }

    fn is_feasible(&self) -> bool {
        self.init == 0 && self.hard >= 0
    }
}

// ---------------------------------------------------------------------------
// SimpleDecimalScore

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct SimpleDecimalScore {
    pub init: i32,
    pub score: Decimal,
}

impl SimpleDecimalScore {
    pub fn of(score: Decimal) -> Self {
        Self { init: 0, score }
    }
}

impl Add for SimpleDecimalScore {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            init: self.init + rhs.init,
            score: self.score + rhs.score,
        }
    }
}

impl Sub for SimpleDecimalScore {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            init: self.init - rhs.init,
            score: self.score - rhs.score,
        }
    }
}

impl Display for SimpleDecimalScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.init != 0 {
            write!(f, "{}init/", self.init)?;
        }
        write!(f, "{}", self.score)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecimalImpacter(Decimal);

impl ScoreImpacter<SimpleDecimalScore> for DecimalImpacter {
    fn apply(&self, match_weight: i64) -> SimpleDecimalScore {
        SimpleDecimalScore::of(self.0 * Decimal::from(match_weight))
    }
}

impl Score for SimpleDecimalScore {
    type Impacter = DecimalImpacter;

    fn zero() -> Self {
        Self::default()
    }

    fn with_init(mut self, init_score: i32) -> Self {
        self.init = init_score;
        self
    }

    fn init_score(&self) -> i32 {
        self.init
    }

    fn build_impacter(weight: &Self) -> DecimalImpacter {
        DecimalImpacter(weight.score)
    }

    fn is_feasible(&self) -> bool {
        self.init == 0
    }
}
