//! Textual pipeline descriptions such as `"PCA64,IVF1024,PQ16"`.
//!
//! The native engine's own parser is authoritative: a generic handle is built
//! by handing it the raw text. The parser here mirrors the common subset of
//! that grammar so a generic handle can be introspected (cluster count,
//! first stage, refinement) without touching native memory, and so a
//! description can be checked before any engine call.
//!
//! # Grammar
//!
//! ```text
//! description := [IDMap ","] {transform ","} core ["," refine]
//! transform   := PCA<d> | PCAR<d> | OPQ<m>[_<d>] | RR<d>
//! core        := Flat | LSH | HNSW[<m>][",Flat"] | PQ<m>[x<nbits>]
//!              | SQ4 | SQ6 | SQ8 | SQfp16 | SQ8_direct
//!              | IVF<nlist> "," (Flat | PQ<m>[x<nbits>] | SQ...)
//! refine      := RFlat | Refine(Flat)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::QuantizerType;
use crate::error::{Error, Result};

const DEFAULT_HNSW_M: usize = 32;
const DEFAULT_PQ_NBITS: usize = 8;

/// A dimensionality-changing stage applied before the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStage {
    /// Principal component analysis down to `d_out` components.
    Pca { d_out: usize, random_rotation: bool },
    /// Optimized product quantization rotation for `m` sub-quantizers.
    Opq { m: usize, d_out: Option<usize> },
    /// Random orthogonal rotation.
    RandomRotation { d_out: usize },
}

/// Storage used for the vectors of an inverted-file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvfStorage {
    Flat,
    Pq { m: usize, nbits: usize },
    Sq(QuantizerType),
}

/// The index stage of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStage {
    Flat,
    Ivf { nlist: usize, storage: IvfStorage },
    Hnsw { m: usize },
    Pq { m: usize, nbits: usize },
    Sq(QuantizerType),
    Lsh,
}

impl CoreStage {
    fn requires_training(&self) -> bool {
        match self {
            CoreStage::Flat | CoreStage::Hnsw { .. } | CoreStage::Lsh => false,
            CoreStage::Ivf { .. } | CoreStage::Pq { .. } => true,
            CoreStage::Sq(qtype) => qtype.requires_training(),
        }
    }
}

/// One stage of a pipeline, in the order it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    IdMap,
    Transform(TransformStage),
    Core(CoreStage),
    Refine,
}

/// A parsed pipeline description.
///
/// # Example
///
/// ```
/// use vecgate_core::descriptor::{PipelineDescriptor, Stage, TransformStage};
///
/// let desc: PipelineDescriptor = "PCA32,IVF100,Flat".parse().unwrap();
/// assert_eq!(desc.nlist(), Some(100));
/// assert!(desc.requires_training());
/// assert_eq!(
///     desc.first_stage(),
///     Stage::Transform(TransformStage::Pca { d_out: 32, random_rotation: false })
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescriptor {
    id_map: bool,
    transforms: Vec<TransformStage>,
    core: CoreStage,
    refine: bool,
}

impl PipelineDescriptor {
    /// Parses a description. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDescription`] for empty text, unknown tokens,
    /// zero parameters, or stages in an order the engine does not accept.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(invalid("empty description"));
        }
        let tokens: Vec<&str> = text.split(',').map(str::trim).collect();
        let mut rest = &tokens[..];

        let mut id_map = false;
        if let Some((&first, tail)) = rest.split_first() {
            if first == "IDMap" || first == "IDMap2" {
                id_map = true;
                rest = tail;
            }
        }

        let mut transforms = Vec::new();
        while let Some((&token, tail)) = rest.split_first() {
            match parse_transform(token)? {
                Some(stage) => {
                    transforms.push(stage);
                    rest = tail;
                }
                None => break,
            }
        }

        let refine = matches!(rest.last(), Some(&"RFlat") | Some(&"Refine(Flat)"));
        if refine {
            rest = &rest[..rest.len() - 1];
        }

        let core = parse_core(rest)?;
        Ok(Self {
            id_map,
            transforms,
            core,
            refine,
        })
    }

    /// Returns true if the pipeline is wrapped in an id map.
    pub fn has_id_map(&self) -> bool {
        self.id_map
    }

    /// Transforms applied before the index, outermost first.
    pub fn transforms(&self) -> &[TransformStage] {
        &self.transforms
    }

    /// The index stage.
    pub fn core(&self) -> &CoreStage {
        &self.core
    }

    /// Returns true if results are re-ranked by an exact refinement stage.
    pub fn has_refinement(&self) -> bool {
        self.refine
    }

    /// All stages in written order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(self.transforms.len() + 3);
        if self.id_map {
            stages.push(Stage::IdMap);
        }
        stages.extend(self.transforms.iter().copied().map(Stage::Transform));
        stages.push(Stage::Core(self.core));
        if self.refine {
            stages.push(Stage::Refine);
        }
        stages
    }

    /// The first written stage.
    pub fn first_stage(&self) -> Stage {
        if self.id_map {
            Stage::IdMap
        } else if let Some(&t) = self.transforms.first() {
            Stage::Transform(t)
        } else {
            Stage::Core(self.core)
        }
    }

    /// Cluster count of an inverted-file core.
    pub fn nlist(&self) -> Option<usize> {
        match self.core {
            CoreStage::Ivf { nlist, .. } => Some(nlist),
            _ => None,
        }
    }

    /// Graph fan-out of an HNSW core.
    pub fn hnsw_m(&self) -> Option<usize> {
        match self.core {
            CoreStage::Hnsw { m } => Some(m),
            _ => None,
        }
    }

    /// Returns true if any stage must be trained before vectors can be added.
    pub fn requires_training(&self) -> bool {
        !self.transforms.is_empty() || self.core.requires_training()
    }

    /// Dimension seen by the core stage for input dimension `d`.
    pub fn core_dimension(&self, d: usize) -> usize {
        self.transforms.iter().fold(d, |dim, t| match *t {
            TransformStage::Pca { d_out, .. } | TransformStage::RandomRotation { d_out } => d_out,
            TransformStage::Opq { d_out, .. } => d_out.unwrap_or(dim),
        })
    }
}

impl FromStr for PipelineDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PipelineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if self.id_map {
            parts.push("IDMap".to_string());
        }
        for t in &self.transforms {
            parts.push(match *t {
                TransformStage::Pca {
                    d_out,
                    random_rotation: false,
                } => format!("PCA{}", d_out),
                TransformStage::Pca {
                    d_out,
                    random_rotation: true,
                } => format!("PCAR{}", d_out),
                TransformStage::Opq { m, d_out: None } => format!("OPQ{}", m),
                TransformStage::Opq { m, d_out: Some(d) } => format!("OPQ{}_{}", m, d),
                TransformStage::RandomRotation { d_out } => format!("RR{}", d_out),
            });
        }
        parts.push(match self.core {
            CoreStage::Flat => "Flat".to_string(),
            CoreStage::Lsh => "LSH".to_string(),
            CoreStage::Hnsw { m } => format!("HNSW{}", m),
            CoreStage::Pq { m, nbits } => pq_text(m, nbits),
            CoreStage::Sq(qtype) => sq_text(qtype).to_string(),
            CoreStage::Ivf { nlist, storage } => {
                let storage = match storage {
                    IvfStorage::Flat => "Flat".to_string(),
                    IvfStorage::Pq { m, nbits } => pq_text(m, nbits),
                    IvfStorage::Sq(qtype) => sq_text(qtype).to_string(),
                };
                format!("IVF{},{}", nlist, storage)
            }
        });
        if self.refine {
            parts.push("RFlat".to_string());
        }
        f.write_str(&parts.join(","))
    }
}

/// Checks a description without constructing anything.
pub fn validate(text: &str) -> Result<()> {
    PipelineDescriptor::parse(text).map(|_| ())
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidDescription(msg.into())
}

/// Parses the positive integer following `prefix`.
fn number(token: &str, prefix: &str) -> Result<usize> {
    let digits = token.strip_prefix(prefix).unwrap_or(token);
    match digits.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(format!("expected a positive number in '{}'", token))),
    }
}

fn parse_transform(token: &str) -> Result<Option<TransformStage>> {
    if token.starts_with("PCAR") {
        return Ok(Some(TransformStage::Pca {
            d_out: number(token, "PCAR")?,
            random_rotation: true,
        }));
    }
    if token.starts_with("PCA") {
        return Ok(Some(TransformStage::Pca {
            d_out: number(token, "PCA")?,
            random_rotation: false,
        }));
    }
    if let Some(rest) = token.strip_prefix("OPQ") {
        let (m, d_out) = match rest.split_once('_') {
            Some((m, d)) => (number(m, "")?, Some(number(d, "")?)),
            None => (number(rest, "")?, None),
        };
        return Ok(Some(TransformStage::Opq { m, d_out }));
    }
    if token.starts_with("RR") {
        return Ok(Some(TransformStage::RandomRotation {
            d_out: number(token, "RR")?,
        }));
    }
    Ok(None)
}

fn parse_pq(token: &str) -> Result<(usize, usize)> {
    let rest = token
        .strip_prefix("PQ")
        .ok_or_else(|| invalid(format!("expected PQ stage, got '{}'", token)))?;
    let (m, nbits) = match rest.split_once('x') {
        Some((m, nbits)) => (number(m, "")?, number(nbits, "")?),
        None => (number(rest, "")?, DEFAULT_PQ_NBITS),
    };
    if nbits > 16 {
        return Err(invalid(format!("{} bits per code is too many", nbits)));
    }
    Ok((m, nbits))
}

fn parse_sq(token: &str) -> Result<QuantizerType> {
    match token {
        "SQ4" => Ok(QuantizerType::FourBit),
        "SQ6" => Ok(QuantizerType::SixBit),
        "SQ8" => Ok(QuantizerType::EightBit),
        "SQfp16" => Ok(QuantizerType::Fp16),
        "SQ8_direct" => Ok(QuantizerType::EightBitDirect),
        _ => Err(invalid(format!("unknown scalar quantizer '{}'", token))),
    }
}

fn parse_core(tokens: &[&str]) -> Result<CoreStage> {
    let (&first, tail) = tokens
        .split_first()
        .ok_or_else(|| invalid("missing index stage"))?;

    let core = if first == "Flat" {
        CoreStage::Flat
    } else if first == "LSH" {
        CoreStage::Lsh
    } else if first.starts_with("IVF") {
        let nlist = number(first, "IVF")?;
        let storage_token = tail
            .first()
            .ok_or_else(|| invalid(format!("'{}' needs a storage stage", first)))?;
        let storage = if *storage_token == "Flat" {
            IvfStorage::Flat
        } else if storage_token.starts_with("PQ") {
            let (m, nbits) = parse_pq(storage_token)?;
            IvfStorage::Pq { m, nbits }
        } else if storage_token.starts_with("SQ") {
            IvfStorage::Sq(parse_sq(storage_token)?)
        } else {
            return Err(invalid(format!("unknown storage '{}'", storage_token)));
        };
        return finish(CoreStage::Ivf { nlist, storage }, &tail[1..]);
    } else if first.starts_with("HNSW") {
        let m = if first == "HNSW" {
            DEFAULT_HNSW_M
        } else {
            number(first, "HNSW")?
        };
        // "HNSW32,Flat" names the default flat storage explicitly.
        let tail = match tail.first() {
            Some(&"Flat") => &tail[1..],
            _ => tail,
        };
        return finish(CoreStage::Hnsw { m }, tail);
    } else if first.starts_with("PQ") {
        let (m, nbits) = parse_pq(first)?;
        CoreStage::Pq { m, nbits }
    } else if first.starts_with("SQ") {
        CoreStage::Sq(parse_sq(first)?)
    } else {
        return Err(invalid(format!("unrecognized stage '{}'", first)));
    };
    finish(core, tail)
}

fn finish(core: CoreStage, trailing: &[&str]) -> Result<CoreStage> {
    match trailing.first() {
        None => Ok(core),
        Some(extra) => Err(invalid(format!("unexpected stage '{}'", extra))),
    }
}

fn pq_text(m: usize, nbits: usize) -> String {
    if nbits == DEFAULT_PQ_NBITS {
        format!("PQ{}", m)
    } else {
        format!("PQ{}x{}", m, nbits)
    }
}

fn sq_text(qtype: QuantizerType) -> &'static str {
    match qtype {
        QuantizerType::FourBit | QuantizerType::FourBitUniform => "SQ4",
        QuantizerType::SixBit => "SQ6",
        QuantizerType::EightBit | QuantizerType::EightBitUniform => "SQ8",
        QuantizerType::Fp16 => "SQfp16",
        QuantizerType::EightBitDirect => "SQ8_direct",
    }
}

/// Query speed preference for [`recommend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPreference {
    Fast,
    #[default]
    Balanced,
    Accurate,
}

/// Memory budget preference for [`recommend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPreference {
    Low,
    #[default]
    Medium,
    High,
}

/// Workload requirements used to pick a description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    /// Target recall in `0.0..=1.0`.
    pub recall: f64,
    pub speed: SpeedPreference,
    pub memory: MemoryPreference,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            recall: 0.9,
            speed: SpeedPreference::default(),
            memory: MemoryPreference::default(),
        }
    }
}

impl Requirements {
    /// Sets the recall target. Chainable.
    pub fn with_recall(mut self, recall: f64) -> Self {
        self.recall = recall;
        self
    }

    /// Sets the speed preference. Chainable.
    pub fn with_speed(mut self, speed: SpeedPreference) -> Self {
        self.speed = speed;
        self
    }

    /// Sets the memory preference. Chainable.
    pub fn with_memory(mut self, memory: MemoryPreference) -> Self {
        self.memory = memory;
        self
    }
}

/// Cluster count for `n` vectors: one list per thousand, within `[100, 65536]`.
pub fn nlist_for(n: u64) -> usize {
    (n / 1000).clamp(100, 65536) as usize
}

/// Recommends a description for `n` vectors of dimension `d`.
///
/// # Example
///
/// ```
/// use vecgate_core::descriptor::{recommend, Requirements, SpeedPreference};
///
/// assert_eq!(recommend(5_000, 128, &Requirements::default()), "Flat");
/// let fast = Requirements::default().with_speed(SpeedPreference::Fast);
/// assert_eq!(recommend(50_000, 128, &fast), "HNSW32");
/// ```
pub fn recommend(n: u64, d: usize, requirements: &Requirements) -> String {
    let nlist = nlist_for(n);
    match n {
        0..=9_999 => "Flat".to_string(),
        10_000..=99_999 => {
            if requirements.speed == SpeedPreference::Fast || requirements.recall >= 0.95 {
                "HNSW32".to_string()
            } else {
                "IVF100,Flat".to_string()
            }
        }
        100_000..=999_999 => match requirements.speed {
            SpeedPreference::Fast if requirements.recall >= 0.95 => "HNSW32".to_string(),
            SpeedPreference::Fast => "HNSW16".to_string(),
            SpeedPreference::Accurate => "HNSW64".to_string(),
            SpeedPreference::Balanced => match requirements.memory {
                MemoryPreference::Low => format!("IVF{},PQ8", nlist),
                _ => format!("IVF{},Flat", nlist),
            },
        },
        1_000_000..=9_999_999 => match requirements.memory {
            MemoryPreference::Low => format!("IVF{},PQ8", nlist),
            MemoryPreference::High => format!("IVF{},Flat", nlist),
            MemoryPreference::Medium if d >= 128 => {
                format!("PCA{},IVF{},PQ8", (d / 2).max(64), nlist)
            }
            MemoryPreference::Medium => format!("IVF{},PQ8", nlist),
        },
        _ => {
            if d >= 256 {
                format!("OPQ16,IVF{},PQ16", nlist)
            } else if d >= 128 {
                format!("PCA{},IVF{},PQ8", d / 2, nlist)
            } else {
                format!("IVF{},PQ8", nlist)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_cores() {
        assert_eq!(
            PipelineDescriptor::parse(" Flat ").unwrap().core(),
            &CoreStage::Flat
        );
        assert_eq!(
            PipelineDescriptor::parse("HNSW").unwrap().hnsw_m(),
            Some(32)
        );
        assert_eq!(
            PipelineDescriptor::parse("HNSW16,Flat").unwrap().hnsw_m(),
            Some(16)
        );
        assert_eq!(
            PipelineDescriptor::parse("PQ8x4").unwrap().core(),
            &CoreStage::Pq { m: 8, nbits: 4 }
        );
        assert_eq!(
            PipelineDescriptor::parse("SQfp16").unwrap().core(),
            &CoreStage::Sq(QuantizerType::Fp16)
        );
    }

    #[test]
    fn test_parse_full_pipeline() {
        let desc = PipelineDescriptor::parse("IDMap,OPQ16_64,IVF4096,PQ16,RFlat").unwrap();
        assert!(desc.has_id_map());
        assert!(desc.has_refinement());
        assert_eq!(desc.nlist(), Some(4096));
        assert_eq!(
            desc.transforms(),
            &[TransformStage::Opq {
                m: 16,
                d_out: Some(64)
            }]
        );
        assert_eq!(desc.core_dimension(128), 64);
        assert_eq!(desc.stages().len(), 4);
        assert_eq!(desc.first_stage(), Stage::IdMap);
    }

    #[test]
    fn test_parse_rejects_bad_text() {
        for text in ["", "   ", "IVF,Flat", "IVF100", "Flat,Flat", "Banana", "PQ0", "HNSW32,PQ8"] {
            assert!(
                matches!(
                    PipelineDescriptor::parse(text),
                    Err(Error::InvalidDescription(_))
                ),
                "accepted {:?}",
                text
            );
        }
    }

    #[test]
    fn test_display_is_canonical() {
        for text in ["PCA32,IVF100,Flat", "IVF256,PQ8x4", "HNSW32", "RR64,SQ8,RFlat"] {
            let desc = PipelineDescriptor::parse(text).unwrap();
            assert_eq!(desc.to_string(), text);
        }
        let desc = PipelineDescriptor::parse("HNSW32,Flat").unwrap();
        assert_eq!(desc.to_string(), "HNSW32");
    }

    #[test]
    fn test_training_requirements() {
        assert!(!PipelineDescriptor::parse("Flat").unwrap().requires_training());
        assert!(!PipelineDescriptor::parse("HNSW32").unwrap().requires_training());
        assert!(PipelineDescriptor::parse("IVF10,Flat").unwrap().requires_training());
        assert!(PipelineDescriptor::parse("PCA8,Flat").unwrap().requires_training());
    }

    #[test]
    fn test_nlist_for_bounds() {
        assert_eq!(nlist_for(10), 100);
        assert_eq!(nlist_for(500_000), 500);
        assert_eq!(nlist_for(1_000_000_000), 65536);
    }

    #[test]
    fn test_recommend_tiers() {
        let defaults = Requirements::default();
        assert_eq!(recommend(20_000, 64, &defaults), "IVF100,Flat");
        assert_eq!(recommend(500_000, 64, &defaults), "IVF500,Flat");
        assert_eq!(
            recommend(500_000, 64, &defaults.with_memory(MemoryPreference::Low)),
            "IVF500,PQ8"
        );
        assert_eq!(
            recommend(500_000, 64, &defaults.with_speed(SpeedPreference::Accurate)),
            "HNSW64"
        );
        assert_eq!(recommend(2_000_000, 96, &defaults), "IVF2000,PQ8");
        assert_eq!(recommend(2_000_000, 128, &defaults), "PCA64,IVF2000,PQ8");
        assert_eq!(recommend(20_000_000, 512, &defaults), "OPQ16,IVF20000,PQ16");
    }

    #[test]
    fn test_recommendations_parse() {
        let defaults = Requirements::default();
        for n in [100, 50_000, 500_000, 5_000_000, 50_000_000] {
            for d in [32, 128, 512] {
                let text = recommend(n, d, &defaults);
                assert!(validate(&text).is_ok(), "{} does not parse", text);
            }
        }
    }

    #[test]
    fn test_requirements_from_json() {
        let req: Requirements = serde_json::from_str(r#"{"speed":"fast"}"#).unwrap();
        assert_eq!(req.speed, SpeedPreference::Fast);
        assert_eq!(req.recall, 0.9);
    }
}
