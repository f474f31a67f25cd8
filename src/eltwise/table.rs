//! Constant table: named bit patterns emitted as one data blob.
//!
//! Registration and layout are two separate phases. Entries are registered
//! while the builder is `Building`; `finalize` assigns offsets in
//! registration order and moves it to `Finalized`, after which lookups are
//! allowed and further registration panics.
//!
//! Broadcast entries are repeated across a full vector (`vlen` bytes) so a
//! vector op can take them as a memory operand. Non-broadcast entries are
//! plain 4-byte words, used for gather-indexed tables.

use std::collections::HashMap;

use super::constants::*;
use super::{ConstGroups, EltwiseConfig};

/// Logical name of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstKey {
    Scale,
    Alpha,
    Beta,
    Zero,
    Half,
    One,
    Two,
    MinusOne,
    MinusTwo,
    Ln2f,
    PositiveMask,
    SignMask,
    ExponentBias,
    ExpLog2ef,
    ExpLnFltMax,
    ExpLnFltMin,
    ExpPol,
    TanhIdxBias,
    TanhIdxMask,
    TanhLinearUbound,
    TanhSaturationLbound,
    FiveBitOffset,
    TanhPolTable,
    SoftReluOneTwentySix,
    SoftReluMantissaSignMask,
    SoftReluPol,
    GeluTanhFittingConst,
    GeluTanhFittingConstTimesThree,
    GeluTanhSqrtTwoOverPi,
    GeluErfApproxConst,
    GeluErfOneOverSqrtTwo,
    GeluErfOneOverSqrtPi,
    GeluErfPol,
    LogMinusInf,
    LogQnan,
    LogMantissaMask,
    LogPol,
    LogPredefinedVals,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: ConstKey,
    bits: u32,
    bcast: bool,
}

#[derive(Debug)]
enum State {
    Building,
    Finalized {
        offsets: HashMap<(ConstKey, usize), u32>,
        size: usize,
    },
}

/// Two-phase constant table builder.
#[derive(Debug)]
pub struct ConstTableBuilder {
    vlen: usize,
    entries: Vec<Entry>,
    state: State,
}

impl ConstTableBuilder {
    /// Empty builder for vectors of `vlen` bytes.
    pub fn new(vlen: usize) -> Self {
        assert!(vlen >= 4 && vlen % 4 == 0, "vector length {vlen} is not a whole number of words");
        ConstTableBuilder {
            vlen,
            entries: Vec::new(),
            state: State::Building,
        }
    }

    /// Register one entry. Entries with the same key form an indexed group.
    pub fn register(&mut self, key: ConstKey, bits: u32, bcast: bool) {
        assert!(
            matches!(self.state, State::Building),
            "constant table already finalized, cannot register {key:?}"
        );
        self.entries.push(Entry { key, bits, bcast });
    }

    pub fn register_all(&mut self, key: ConstKey, bits: &[u32], bcast: bool) {
        for &b in bits {
            self.register(key, b, bcast);
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, State::Finalized { .. })
    }

    /// Assign offsets in registration order.
    pub fn finalize(&mut self) {
        assert!(!self.is_finalized(), "constant table finalized twice");
        let mut offsets = HashMap::with_capacity(self.entries.len());
        let mut counts: HashMap<ConstKey, usize> = HashMap::new();
        let mut off = 0usize;
        for e in &self.entries {
            let n = counts.entry(e.key).or_insert(0);
            offsets.insert((e.key, *n), off as u32);
            *n += 1;
            off += if e.bcast { self.vlen } else { 4 };
        }
        self.state = State::Finalized { offsets, size: off };
    }

    /// Byte offset of `key[index]` from the table start.
    pub fn offset(&self, key: ConstKey, index: usize) -> u32 {
        match &self.state {
            State::Finalized { offsets, .. } => match offsets.get(&(key, index)) {
                Some(&off) => off,
                None => panic!("constant {key:?}[{index}] was not registered"),
            },
            State::Building => panic!("constant table queried before finalize"),
        }
    }

    pub fn contains(&self, key: ConstKey) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    /// Table size in bytes (0 before finalize).
    pub fn size(&self) -> usize {
        match self.state {
            State::Finalized { size, .. } => size,
            State::Building => 0,
        }
    }

    /// The table blob as 32-bit words, broadcast entries expanded.
    pub fn words(&self) -> Vec<u32> {
        assert!(self.is_finalized(), "constant table emitted before finalize");
        let lanes = self.vlen / 4;
        let mut out = Vec::with_capacity(self.size() / 4);
        for e in &self.entries {
            let n = if e.bcast { lanes } else { 1 };
            out.extend(std::iter::repeat(e.bits).take(n));
        }
        out
    }

    /// Register every constant `cfg` needs, in layout order.
    pub fn for_config(cfg: &EltwiseConfig, vlen: usize) -> Self {
        let mut t = ConstTableBuilder::new(vlen);
        t.register(ConstKey::Scale, cfg.scale.to_bits(), true);
        t.register(ConstKey::Alpha, cfg.alpha.to_bits(), true);
        t.register(ConstKey::Beta, cfg.beta.to_bits(), true);
        t.register_common();
        t.register_groups(cfg.const_groups());
        t.finalize();
        t
    }

    fn register_common(&mut self) {
        use ConstKey::*;
        for (k, v) in [
            (Zero, ZERO),
            (Half, HALF),
            (One, ONE),
            (Two, TWO),
            (MinusOne, MINUS_ONE),
            (MinusTwo, MINUS_TWO),
            (Ln2f, LN2F),
            (PositiveMask, POSITIVE_MASK),
            (SignMask, SIGN_MASK),
            (ExponentBias, EXPONENT_BIAS),
        ] {
            self.register(k, v, true);
        }
    }

    fn register_groups(&mut self, g: ConstGroups) {
        use ConstKey::*;
        if g.exp {
            self.register(ExpLog2ef, EXP_LOG2EF, true);
            self.register(ExpLnFltMax, EXP_LN_FLT_MAX, true);
            self.register(ExpLnFltMin, EXP_LN_FLT_MIN, true);
            self.register_all(ExpPol, &EXP_POL, true);
        }
        if g.tanh {
            self.register(TanhIdxBias, TANH_IDX_BIAS, true);
            self.register(TanhIdxMask, TANH_IDX_MASK, true);
            self.register(TanhLinearUbound, TANH_LINEAR_UBOUND, true);
            self.register(TanhSaturationLbound, TANH_SATURATION_LBOUND, true);
        }
        if g.tanh || g.log {
            self.register(FiveBitOffset, LOG_FIVE_BIT_OFFSET, true);
        }
        if g.tanh {
            self.register_all(TanhPolTable, &TANH_POL_TABLE, false);
        }
        if g.soft_relu {
            self.register(SoftReluOneTwentySix, SOFT_RELU_ONE_TWENTY_SIX, true);
            self.register(SoftReluMantissaSignMask, SOFT_RELU_MANTISSA_SIGN_MASK, true);
            self.register_all(SoftReluPol, &SOFT_RELU_POL, true);
        }
        if g.gelu_tanh {
            self.register(GeluTanhFittingConst, GELU_TANH_FITTING_CONST, true);
            self.register(
                GeluTanhFittingConstTimesThree,
                GELU_TANH_FITTING_CONST_TIMES_THREE,
                true,
            );
            self.register(GeluTanhSqrtTwoOverPi, GELU_TANH_SQRT_TWO_OVER_PI, true);
        }
        if g.gelu_erf {
            self.register(GeluErfApproxConst, GELU_ERF_APPROX_CONST, true);
            self.register(GeluErfOneOverSqrtTwo, GELU_ERF_ONE_OVER_SQRT_TWO, true);
            self.register(GeluErfOneOverSqrtPi, GELU_ERF_ONE_OVER_SQRT_PI, true);
            self.register_all(GeluErfPol, &GELU_ERF_POL, true);
        }
        if g.log {
            self.register(LogMinusInf, LOG_MINUS_INF, true);
            self.register(LogQnan, LOG_QNAN, true);
            self.register(LogMantissaMask, LOG_MANTISSA_MASK, true);
            self.register_all(LogPol, &LOG_POL, true);
            self.register_all(LogPredefinedVals, &LOG_PREDEFINED_VALS, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eltwise::EltwiseAlg;

    #[test]
    fn test_offsets_follow_registration_order() {
        let mut t = ConstTableBuilder::new(32);
        t.register(ConstKey::One, ONE, true);
        t.register_all(ConstKey::TanhPolTable, &[1, 2, 3], false);
        t.register(ConstKey::Two, TWO, true);
        t.finalize();
        assert_eq!(t.offset(ConstKey::One, 0), 0);
        assert_eq!(t.offset(ConstKey::TanhPolTable, 0), 32);
        assert_eq!(t.offset(ConstKey::TanhPolTable, 2), 40);
        assert_eq!(t.offset(ConstKey::Two, 0), 44);
        assert_eq!(t.size(), 76);

        let w = t.words();
        assert_eq!(w.len(), 19);
        assert!(w[..8].iter().all(|&x| x == ONE));
        assert_eq!(&w[8..11], &[1, 2, 3]);
        assert!(w[11..].iter().all(|&x| x == TWO));
    }

    #[test]
    #[should_panic(expected = "already finalized")]
    fn test_late_registration_panics() {
        let mut t = ConstTableBuilder::new(64);
        t.register(ConstKey::Zero, ZERO, true);
        t.finalize();
        t.register(ConstKey::One, ONE, true);
    }

    #[test]
    #[should_panic(expected = "before finalize")]
    fn test_lookup_before_finalize_panics() {
        let mut t = ConstTableBuilder::new(64);
        t.register(ConstKey::Zero, ZERO, true);
        t.offset(ConstKey::Zero, 0);
    }

    #[test]
    fn test_config_tables() {
        let t = ConstTableBuilder::for_config(&EltwiseConfig::new(EltwiseAlg::Relu), 64);
        assert!(!t.contains(ConstKey::ExpPol));
        assert_eq!(t.offset(ConstKey::Scale, 0), 0);
        assert_eq!(t.offset(ConstKey::Zero, 0), 3 * 64);

        let t = ConstTableBuilder::for_config(&EltwiseConfig::new(EltwiseAlg::GeluTanh), 32);
        assert!(t.contains(ConstKey::TanhPolTable));
        assert!(t.contains(ConstKey::FiveBitOffset));
        let base = t.offset(ConstKey::TanhPolTable, 0);
        assert_eq!(t.offset(ConstKey::TanhPolTable, 223), base + 223 * 4);
        assert!(t.offset(ConstKey::GeluTanhFittingConst, 0) > base);

        let t = ConstTableBuilder::for_config(&EltwiseConfig::new(EltwiseAlg::Log), 32);
        assert_eq!(t.words().len() * 4, t.size());
        assert!(!t.contains(ConstKey::TanhPolTable));
    }
}
