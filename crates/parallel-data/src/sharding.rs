use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Path of shard `index` of `path`: the file name gains a two-digit,
/// zero-padded suffix (`train.en` -> `train.en.03`).
pub fn shard_path(path: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{index:02}"));
    PathBuf::from(name)
}

/// Split `source` into `num_shards` contiguous, disjoint line ranges of
/// `ceil(lines / num_shards)` lines each. Trailing shards may be shorter or
/// empty. Returns the ordered shard paths.
pub fn shard_text_by_count(source: &Path, num_shards: usize) -> io::Result<Vec<PathBuf>> {
    if num_shards == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "num_shards must be greater than zero",
        ));
    }

    let total = count_lines(source)?;
    let per_shard = total.div_ceil(num_shards).max(1);

    let reader = BufReader::new(File::open(source)?);
    let mut shards = Vec::with_capacity(num_shards);
    let mut writer = open_shard(source, 0, &mut shards)?;
    let mut lines_in_shard = 0usize;

    for line in reader.lines() {
        let line = line?;

        if lines_in_shard >= per_shard && shards.len() < num_shards {
            writer.flush()?;
            writer = open_shard(source, shards.len(), &mut shards)?;
            lines_in_shard = 0;
        }

        writeln!(writer, "{}", line)?;
        lines_in_shard += 1;
    }
    writer.flush()?;

    while shards.len() < num_shards {
        let mut empty = open_shard(source, shards.len(), &mut shards)?;
        empty.flush()?;
    }

    tracing::debug!(
        source = %source.display(),
        shards = num_shards,
        lines = total,
        per_shard,
        "sharded corpus file"
    );

    Ok(shards)
}

/// Shard both sides of a parallel corpus identically, so shard `i` of the
/// source stays aligned with shard `i` of the target.
pub fn shard_parallel_corpus(
    source: &Path,
    target: &Path,
    num_shards: usize,
) -> io::Result<Vec<(PathBuf, PathBuf)>> {
    let source_lines = count_lines(source)?;
    let target_lines = count_lines(target)?;
    if source_lines != target_lines {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "cannot shard misaligned corpus: {} has {} lines, {} has {}",
                source.display(),
                source_lines,
                target.display(),
                target_lines
            ),
        ));
    }

    let sources = shard_text_by_count(source, num_shards)?;
    let targets = shard_text_by_count(target, num_shards)?;
    Ok(sources.into_iter().zip(targets).collect())
}

fn count_lines(path: &Path) -> io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0usize;
    for line in reader.lines() {
        line?;
        count += 1;
    }
    Ok(count)
}

fn open_shard(
    source: &Path,
    index: usize,
    shards: &mut Vec<PathBuf>,
) -> io::Result<BufWriter<File>> {
    let path = shard_path(source, index);
    let file = File::create(&path)?;
    shards.push(path);
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_lines(path: &Path, count: usize) {
        let mut file = File::create(path).unwrap();
        for i in 0..count {
            writeln!(file, "line-{i}").unwrap();
        }
    }

    fn read(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| line.to_string())
            .collect()
    }

    #[test]
    fn suffix_is_two_digit_zero_padded() {
        let path = shard_path(Path::new("/data/train.en"), 3);
        assert_eq!(path, PathBuf::from("/data/train.en.03"));
        let path = shard_path(Path::new("dev.hi"), 12);
        assert_eq!(path, PathBuf::from("dev.hi.12"));
    }

    #[test]
    fn shards_take_ceil_of_lines_per_worker() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("corpus.txt");
        write_lines(&source, 5);

        let shards = shard_text_by_count(&source, 2).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(read(&shards[0]), vec!["line-0", "line-1", "line-2"]);
        assert_eq!(read(&shards[1]), vec!["line-3", "line-4"]);
    }

    #[test]
    fn surplus_workers_receive_empty_shards() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("tiny.txt");
        write_lines(&source, 2);

        let shards = shard_text_by_count(&source, 4).unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(read(&shards[0]), vec!["line-0"]);
        assert_eq!(read(&shards[1]), vec!["line-1"]);
        assert!(read(&shards[2]).is_empty());
        assert!(read(&shards[3]).is_empty());
    }

    #[test]
    fn parallel_shards_stay_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("train.en");
        let tgt = dir.path().join("train.hi");
        write_lines(&src, 7);
        write_lines(&tgt, 7);

        let shards = shard_parallel_corpus(&src, &tgt, 3).unwrap();
        assert_eq!(shards.len(), 3);
        for (source, target) in &shards {
            assert_eq!(read(source), read(target));
        }
        assert_eq!(shards[2].0, dir.path().join("train.en.02"));
    }

    #[test]
    fn reject_zero_shards() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("file.txt");
        File::create(&source).unwrap();

        let err = shard_text_by_count(&source, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn reject_misaligned_parallel_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let tgt = dir.path().join("b.txt");
        write_lines(&src, 3);
        write_lines(&tgt, 4);

        let err = shard_parallel_corpus(&src, &tgt, 2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
