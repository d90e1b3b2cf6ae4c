use crate::error::HarnessError;
use crate::settings::Complexity;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub mod actions;
pub mod database;
pub mod scenario;

pub use actions::{Action, ActionEnv, ActionKind};
pub use database::Database;
pub use scenario::{
    BackupRestoreAction, CancelAction, ComposeController, KillAction, ProcessController,
};

/// Child seeds are drawn from `0..SEED_RANGE`.
pub const SEED_RANGE: u64 = 1_000_000;

/// Derive an independent random stream from `parent`.
pub fn child_rng(parent: &mut StdRng) -> StdRng {
    StdRng::seed_from_u64(parent.gen_range(0..SEED_RANGE))
}

/// A named group of actions sharing a weight vector and autocommit policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionCategory {
    pub name: &'static str,
    pub kinds: &'static [ActionKind],
    pub weights: &'static [f64],
    pub autocommit: bool,
}

impl ActionCategory {
    /// One instance per action class, each with its own stream from `rng`.
    pub fn instantiate(
        &self,
        env: &ActionEnv,
        rng: &mut StdRng,
    ) -> Result<Vec<Box<dyn Action>>, HarnessError> {
        self.kinds
            .iter()
            .map(|kind| kind.instantiate(env, child_rng(rng)))
            .collect()
    }

    pub fn describe(&self) -> String {
        self.kinds
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub const READ: ActionCategory = ActionCategory {
    name: "read",
    kinds: &[
        ActionKind::Select,
        ActionKind::SelectOne,
        ActionKind::CommitRollback,
    ],
    weights: &[10.0, 1.0, 1.0],
    autocommit: false,
};

pub const FETCH: ActionCategory = ActionCategory {
    name: "fetch",
    kinds: &[ActionKind::Fetch],
    weights: &[1.0],
    autocommit: false,
};

pub const WRITE: ActionCategory = ActionCategory {
    name: "write",
    kinds: &[
        ActionKind::Insert,
        ActionKind::SelectOne,
        ActionKind::CommitRollback,
    ],
    weights: &[100.0, 1.0, 10.0],
    autocommit: false,
};

pub const DML_NONTRANS: ActionCategory = ActionCategory {
    name: "dml_nontrans",
    kinds: &[
        ActionKind::Delete,
        ActionKind::Update,
        ActionKind::Comment,
        ActionKind::InsertReturning,
    ],
    weights: &[10.0, 10.0, 1.0, 5.0],
    autocommit: true,
};

pub const DDL: ActionCategory = ActionCategory {
    name: "ddl",
    kinds: &[
        ActionKind::CreateTable,
        ActionKind::DropTable,
        ActionKind::RenameTable,
        ActionKind::CreateView,
        ActionKind::DropView,
        ActionKind::CreateRole,
        ActionKind::DropRole,
    ],
    weights: &[10.0, 5.0, 5.0, 10.0, 5.0, 2.0, 1.0],
    autocommit: true,
};

/// The five categories, in the order the complexity weights refer to.
pub static CATEGORIES: [ActionCategory; 5] = [READ, FETCH, WRITE, DML_NONTRANS, DDL];

/// Raw category weights for a complexity tier, aligned with [`CATEGORIES`].
pub fn category_weights(complexity: Complexity) -> [f64; 5] {
    match complexity {
        Complexity::Full => [60.0, 30.0, 30.0, 30.0, 10.0],
        Complexity::Reduced => [60.0, 30.0, 30.0, 30.0, 0.0],
        Complexity::ReadOnly => [60.0, 30.0, 0.0, 0.0, 0.0],
    }
}

/// Category weights normalized to probabilities.
pub fn category_probabilities(complexity: Complexity) -> [f64; 5] {
    let weights = category_weights(complexity);
    let total: f64 = weights.iter().sum();
    weights.map(|w| w / total)
}

/// Draws one category per worker slot.
pub struct CategorySelector {
    index: WeightedIndex<f64>,
}

impl CategorySelector {
    pub fn new(complexity: Complexity) -> Result<Self, HarnessError> {
        let index = WeightedIndex::new(category_weights(complexity)).map_err(|e| {
            HarnessError::Config(format!("invalid category weights for {complexity}: {e}"))
        })?;
        Ok(Self { index })
    }

    pub fn select(&self, rng: &mut StdRng) -> &'static ActionCategory {
        &CATEGORIES[self.index.sample(rng)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIERS: [Complexity; 3] = [Complexity::Full, Complexity::Reduced, Complexity::ReadOnly];

    #[test]
    fn probabilities_sum_to_one_for_every_tier() {
        for tier in TIERS {
            let total: f64 = category_probabilities(tier).iter().sum();
            assert!((total - 1.0).abs() < 1e-9, "{tier}: {total}");
        }
    }

    #[test]
    fn schema_changes_disabled_below_full() {
        assert_eq!(category_weights(Complexity::Full)[4], 10.0);
        assert_eq!(category_weights(Complexity::Reduced)[4], 0.0);
        assert_eq!(category_weights(Complexity::ReadOnly)[4], 0.0);
        assert_eq!(CATEGORIES[4].name, "ddl");
    }

    #[test]
    fn read_only_never_selects_writes() {
        let selector = CategorySelector::new(Complexity::ReadOnly).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..1_000 {
            let category = selector.select(&mut rng);
            assert!(
                category.name == "read" || category.name == "fetch",
                "unexpected {}",
                category.name
            );
        }
    }

    #[test]
    fn every_category_has_matching_weights() {
        for category in CATEGORIES {
            assert_eq!(category.kinds.len(), category.weights.len(), "{}", category.name);
            assert!(category.kinds.iter().all(|k| !k.is_scenario()));
        }
    }

    #[test]
    fn selection_is_reproducible() {
        let selector = CategorySelector::new(Complexity::Full).unwrap();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32).map(|_| selector.select(&mut rng).name).collect::<Vec<_>>()
        };
        assert_eq!(draw(5), draw(5));
    }
}
