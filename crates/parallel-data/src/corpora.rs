use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Ordered (source, target) language identifier, e.g. `en-hi`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.source, self.target)
    }

    /// Monolingual pairs are trained as denoising autoencoders.
    pub fn is_monolingual(&self) -> bool {
        self.source == self.target
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParallelExample {
    pub source: String,
    pub target: String,
}

/// Sentence-aligned corpus for one language pair: line `i` of the source file
/// pairs with line `i` of the target file.
#[derive(Clone, Debug)]
pub struct ParallelCorpus {
    pair: LanguagePair,
    examples: Vec<ParallelExample>,
}

impl ParallelCorpus {
    pub fn new(pair: LanguagePair, examples: Vec<ParallelExample>) -> Self {
        Self { pair, examples }
    }

    pub fn load(pair: LanguagePair, source: &Path, target: &Path) -> io::Result<Self> {
        let sources = read_lines(source)?;
        let targets = read_lines(target)?;

        if sources.len() != targets.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "corpus {} is misaligned: {} has {} lines but {} has {}",
                    pair,
                    source.display(),
                    sources.len(),
                    target.display(),
                    targets.len()
                ),
            ));
        }

        let examples = sources
            .into_iter()
            .zip(targets)
            .map(|(source, target)| ParallelExample { source, target })
            .collect::<Vec<_>>();

        tracing::info!(pair = %pair, examples = examples.len(), "loaded parallel corpus");

        Ok(Self { pair, examples })
    }

    pub fn pair(&self) -> &LanguagePair {
        &self.pair
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[ParallelExample] {
        &self.examples
    }

    pub fn into_examples(self) -> Vec<ParallelExample> {
        self.examples
    }
}

/// Reads every line of `path` with surrounding whitespace removed. Blank lines
/// are kept so that alignment with a sibling file is preserved.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let file = File::open(path).map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("failed to open {}: {}", path.display(), err),
        )
    })?;
    let reader = BufReader::new(file);
    reader
        .lines()
        .map(|line| line.map(|value| value.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, lines: &[&str]) {
        let mut file = File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[test]
    fn loads_aligned_lines() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("train.en");
        let tgt = dir.path().join("train.hi");
        write_file(&src, &["hello world ", "good morning"]);
        write_file(&tgt, &["namaste duniya", " suprabhat"]);

        let corpus = ParallelCorpus::load(LanguagePair::new("en", "hi"), &src, &tgt).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.examples()[0].source, "hello world");
        assert_eq!(corpus.examples()[1].target, "suprabhat");
        assert_eq!(corpus.pair().id(), "en-hi");
    }

    #[test]
    fn rejects_misaligned_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("train.en");
        let tgt = dir.path().join("train.ta");
        write_file(&src, &["a b", "c d", "e f"]);
        write_file(&tgt, &["x y"]);

        let err = ParallelCorpus::load(LanguagePair::new("en", "ta"), &src, &tgt).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn monolingual_pairs_are_detected() {
        assert!(LanguagePair::new("hi", "hi").is_monolingual());
        assert!(!LanguagePair::new("en", "hi").is_monolingual());
    }
}
