use anyhow::Context;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::path::Path;
use typerace_types::{Article, Difficulty};

/// Typing challenges grouped by difficulty.
///
/// The YAML form maps each difficulty to a list of articles:
///
/// ```yaml
/// easy:
///   - title: Morning
///     text: The sun came up over the quiet town.
/// hard:
///   - title: Entropy
///     text: ...
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catalog {
    articles: BTreeMap<Difficulty, Vec<Article>>,
}

impl Catalog {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let articles: BTreeMap<Difficulty, Vec<Article>> =
            serde_yaml::from_str(raw).context("parse article catalog")?;
        for (difficulty, list) in &articles {
            if list.is_empty() {
                anyhow::bail!("article catalog has no entries for {}", difficulty.as_str());
            }
            if list.iter().any(|article| article.text.trim().is_empty()) {
                anyhow::bail!("article catalog has an empty text for {}", difficulty.as_str());
            }
        }
        Ok(Self { articles })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read article catalog {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    pub fn articles(&self, difficulty: Difficulty) -> &[Article] {
        self.articles
            .get(&difficulty)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Articles for `difficulty` in random order.
    pub fn challenge_set(&self, difficulty: Difficulty) -> Vec<Article> {
        let mut set = self.articles(difficulty).to_vec();
        set.shuffle(&mut rand::thread_rng());
        set
    }

    pub fn iter(&self) -> impl Iterator<Item = (Difficulty, &Article)> {
        self.articles
            .iter()
            .flat_map(|(difficulty, list)| list.iter().map(move |article| (*difficulty, article)))
    }

    pub fn len(&self) -> usize {
        self.articles.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn article(title: &str, text: &str) -> Article {
    Article {
        title: title.to_string(),
        text: text.to_string(),
    }
}

impl Default for Catalog {
    fn default() -> Self {
        let mut articles = BTreeMap::new();
        articles.insert(
            Difficulty::Easy,
            vec![
                article("Harbor", "The boats rocked in the harbor while gulls circled over the pier."),
                article("Garden", "She planted beans in the spring and picked them before the first frost."),
                article("Library", "The old library smelled of paper and dust and quiet afternoons."),
            ],
        );
        articles.insert(
            Difficulty::Medium,
            vec![
                article(
                    "Lighthouse",
                    "Every night the keeper climbed one hundred and twelve steps, trimmed the wick, and watched the beam sweep across the black water.",
                ),
                article(
                    "Market",
                    "By seven o'clock the square was crowded: fishmongers shouted prices, bakers stacked warm loaves, and children chased pigeons between the stalls.",
                ),
            ],
        );
        articles.insert(
            Difficulty::Hard,
            vec![
                article(
                    "Thermodynamics",
                    "Entropy, loosely described as disorder, never decreases in an isolated system; consequently, a perpetual-motion machine of the second kind (one converting heat wholly into work) is impossible.",
                ),
                article(
                    "Cartography",
                    "Mercator's 1569 projection preserved angles, which made rhumb-line navigation straightforward, yet it inflated high-latitude areas so badly that Greenland appears comparable in size to Africa.",
                ),
            ],
        );
        Self { articles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_covers_every_difficulty() {
        let catalog = Catalog::default();
        for difficulty in Difficulty::ALL {
            assert!(!catalog.articles(difficulty).is_empty(), "{difficulty:?}");
        }
    }

    #[test]
    fn parses_yaml() {
        let catalog = Catalog::from_yaml_str(
            "easy:\n  - title: One\n    text: first text\n  - title: Two\n    text: second text\n",
        )
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.articles(Difficulty::Hard).is_empty());
        let mut titles: Vec<_> = catalog
            .challenge_set(Difficulty::Easy)
            .into_iter()
            .map(|article| article.title)
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["One", "Two"]);
    }

    #[test]
    fn rejects_empty_sections() {
        assert!(Catalog::from_yaml_str("medium: []\n").is_err());
        assert!(Catalog::from_yaml_str("nightmare:\n  - title: x\n    text: y\n").is_err());
    }
}
