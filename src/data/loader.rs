//! Corpus reading and deterministic calibration sample selection.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use candle_core::Device;
use rand::prelude::*;
use tokenizers::Tokenizer;

use super::CalibBatch;
use crate::config::CalibDataset;
use crate::KvCalibError;

/// pileval documents longer than this many tokens are skipped
const PILEVAL_MAX_DOC_TOKENS: usize = 512;

/// Loads a calibration corpus and cuts it into calibration batches.
pub struct CalibLoader {
    dataset: CalibDataset,
    data_path: PathBuf,
    nsamples: usize,
    seqlen: usize,
    seed: u64,
}

impl CalibLoader {
    pub fn new(
        dataset: CalibDataset,
        data_path: impl AsRef<Path>,
        nsamples: usize,
        seqlen: usize,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            data_path: data_path.as_ref().to_path_buf(),
            nsamples,
            seqlen,
            seed,
        }
    }

    /// Load a `tokenizer.json`
    pub fn load_tokenizer(path: impl AsRef<Path>) -> crate::Result<Tokenizer> {
        Tokenizer::from_file(path.as_ref())
            .map_err(|e| KvCalibError::TokenizerError(format!("Failed to load tokenizer: {}", e)))
    }

    /// Read the corpus as a list of documents
    pub fn read_documents(&self) -> crate::Result<Vec<String>> {
        if !self.data_path.exists() {
            return Err(KvCalibError::DatasetError(format!(
                "{} corpus not found at {:?}",
                self.dataset, self.data_path
            )));
        }

        tracing::debug!("Reading {} corpus from {:?}", self.dataset, self.data_path);

        if self.dataset.is_jsonl() {
            read_jsonl_texts(&self.data_path)
        } else {
            let content = std::fs::read_to_string(&self.data_path)?;
            Ok(content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect())
        }
    }

    /// Tokenize the corpus and produce the calibration batches on `device`
    pub fn load(&self, tokenizer: &Tokenizer, device: &Device) -> crate::Result<Vec<CalibBatch>> {
        let documents = self.read_documents()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let encode = |text: &str| -> crate::Result<Vec<u32>> {
            tokenizer
                .encode(text, true)
                .map(|encoding| encoding.get_ids().to_vec())
                .map_err(|e| KvCalibError::TokenizerError(format!("Tokenization failed: {}", e)))
        };

        let batches = match self.dataset {
            CalibDataset::Wikitext2 | CalibDataset::Ptb => {
                let separator = if self.dataset == CalibDataset::Wikitext2 {
                    "\n\n"
                } else {
                    " "
                };
                let ids = encode(&documents.join(separator))?;
                random_windows(&ids, self.nsamples, self.seqlen, &mut rng)?
                    .into_iter()
                    .map(|window| CalibBatch::labeled(window, device))
                    .collect::<crate::Result<Vec<_>>>()?
            }
            CalibDataset::C4 => {
                document_windows(&documents, encode, self.nsamples, self.seqlen, &mut rng)?
                    .into_iter()
                    .map(|window| CalibBatch::labeled(window, device))
                    .collect::<crate::Result<Vec<_>>>()?
            }
            CalibDataset::Pileval => {
                concat_blocks(documents, encode, self.nsamples, self.seqlen, &mut rng)?
                    .into_iter()
                    .map(|block| CalibBatch::tokens(block, device))
                    .collect::<crate::Result<Vec<_>>>()?
            }
        };

        tracing::info!(
            "Loaded {} calibration samples of {} tokens from {}",
            batches.len(),
            self.seqlen,
            self.dataset
        );

        Ok(batches)
    }
}

fn read_jsonl_texts(path: &Path) -> crate::Result<Vec<String>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut texts = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let value: serde_json::Value = serde_json::from_str(&line)?;
        let text = value["text"].as_str().ok_or_else(|| {
            KvCalibError::DatasetError(format!(
                "{:?} line {} has no string `text` field",
                path,
                line_no + 1
            ))
        })?;
        texts.push(text.to_string());
    }

    Ok(texts)
}

/// `nsamples` random windows of `seqlen` tokens from one token stream
pub fn random_windows<R: Rng>(
    ids: &[u32],
    nsamples: usize,
    seqlen: usize,
    rng: &mut R,
) -> crate::Result<Vec<Vec<u32>>> {
    if ids.len() <= seqlen {
        return Err(KvCalibError::DatasetError(format!(
            "corpus has {} tokens, need more than {} for one sample",
            ids.len(),
            seqlen
        )));
    }

    Ok((0..nsamples)
        .map(|_| {
            let start = rng.random_range(0..ids.len() - seqlen);
            ids[start..start + seqlen].to_vec()
        })
        .collect())
}

/// `nsamples` windows, each from a random document longer than `seqlen` tokens
pub fn document_windows<R, F>(
    documents: &[String],
    mut encode: F,
    nsamples: usize,
    seqlen: usize,
    rng: &mut R,
) -> crate::Result<Vec<Vec<u32>>>
where
    R: Rng,
    F: FnMut(&str) -> crate::Result<Vec<u32>>,
{
    if documents.is_empty() {
        return Err(KvCalibError::DatasetError("corpus is empty".to_string()));
    }

    let max_attempts = documents.len().max(nsamples) * 16;
    let mut windows = Vec::with_capacity(nsamples);
    let mut attempts = 0;

    while windows.len() < nsamples {
        if attempts == max_attempts {
            return Err(KvCalibError::DatasetError(format!(
                "found only {} documents longer than {} tokens after {} draws",
                windows.len(),
                seqlen,
                attempts
            )));
        }
        attempts += 1;

        let doc = &documents[rng.random_range(0..documents.len())];
        let ids = encode(doc)?;
        if ids.len() <= seqlen {
            continue;
        }

        let start = rng.random_range(0..ids.len() - seqlen);
        windows.push(ids[start..start + seqlen].to_vec());
    }

    Ok(windows)
}

/// Shuffle documents, keep up to `nsamples` short non-empty ones, concatenate
/// their tokens and cut the stream into contiguous `seqlen` blocks.
pub fn concat_blocks<R, F>(
    mut documents: Vec<String>,
    mut encode: F,
    nsamples: usize,
    seqlen: usize,
    rng: &mut R,
) -> crate::Result<Vec<Vec<u32>>>
where
    R: Rng,
    F: FnMut(&str) -> crate::Result<Vec<u32>>,
{
    documents.shuffle(rng);

    let mut stream = Vec::new();
    let mut kept = 0;
    for doc in &documents {
        let ids = encode(doc.trim())?;
        if ids.is_empty() || ids.len() > PILEVAL_MAX_DOC_TOKENS {
            continue;
        }
        stream.extend_from_slice(&ids);
        kept += 1;
        if kept == nsamples {
            break;
        }
    }

    let n_split = stream.len() / seqlen;
    if n_split == 0 {
        return Err(KvCalibError::DatasetError(format!(
            "{} usable tokens cannot fill one block of {}",
            stream.len(),
            seqlen
        )));
    }

    tracing::debug!("Split {} tokens into {} blocks", stream.len(), n_split);

    Ok(stream
        .chunks_exact(seqlen)
        .take(n_split)
        .map(<[u32]>::to_vec)
        .collect())
}
