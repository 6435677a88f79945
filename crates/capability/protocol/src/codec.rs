//! 寄存器值解码
//!
//! `value = raw * scale`。有符号类型按补码解释，多寄存器类型按画像给定的字序拼接。

use domain::{DataType, RegisterDefinition, WordOrder};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected} registers, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("decoded value is not finite")]
    NotFinite,
    #[error("value {0} out of range for data type")]
    OutOfRange(f64),
}

/// 按寄存器定义解码为工程值。
pub fn decode(definition: &RegisterDefinition, words: &[u16]) -> Result<f64, DecodeError> {
    let raw = decode_raw(definition.data_type, definition.word_order, words)?;
    let value = raw * definition.scale;
    if !value.is_finite() {
        return Err(DecodeError::NotFinite);
    }
    Ok(value)
}

/// 解码原始值（未缩放）。
pub fn decode_raw(
    data_type: DataType,
    word_order: WordOrder,
    words: &[u16],
) -> Result<f64, DecodeError> {
    let expected = usize::from(data_type.register_count());
    if words.len() != expected {
        return Err(DecodeError::WrongLength {
            expected,
            actual: words.len(),
        });
    }

    let bits = combine(words, word_order);
    let raw = match data_type {
        DataType::Int16 => f64::from(bits as u16 as i16),
        DataType::Uint16 => f64::from(bits as u16),
        DataType::Int32 => f64::from(bits as u32 as i32),
        DataType::Uint32 => f64::from(bits as u32),
        DataType::Float32 => f64::from(f32::from_bits(bits as u32)),
        DataType::Float64 => f64::from_bits(bits),
    };
    Ok(raw)
}

/// `decode` 的逆运算（测试与模拟设备使用）。
pub fn encode(definition: &RegisterDefinition, value: f64) -> Result<Vec<u16>, DecodeError> {
    let raw = value / definition.scale;
    if !raw.is_finite() {
        return Err(DecodeError::NotFinite);
    }
    let bits = match definition.data_type {
        DataType::Int16 => integer_bits(raw, f64::from(i16::MIN), f64::from(i16::MAX))? as i16
            as u16 as u64,
        DataType::Uint16 => integer_bits(raw, 0.0, f64::from(u16::MAX))? as u64,
        DataType::Int32 => integer_bits(raw, f64::from(i32::MIN), f64::from(i32::MAX))? as i32
            as u32 as u64,
        DataType::Uint32 => integer_bits(raw, 0.0, f64::from(u32::MAX))? as u64,
        DataType::Float32 => u64::from((raw as f32).to_bits()),
        DataType::Float64 => raw.to_bits(),
    };
    Ok(split(
        bits,
        usize::from(definition.data_type.register_count()),
        definition.word_order,
    ))
}

fn integer_bits(raw: f64, min: f64, max: f64) -> Result<i64, DecodeError> {
    let rounded = raw.round();
    if rounded < min || rounded > max {
        return Err(DecodeError::OutOfRange(raw));
    }
    Ok(rounded as i64)
}

fn combine(words: &[u16], word_order: WordOrder) -> u64 {
    let fold = |acc: u64, word: &u16| (acc << 16) | u64::from(*word);
    match word_order {
        WordOrder::BigEndian => words.iter().fold(0, fold),
        WordOrder::LittleEndian => words.iter().rev().fold(0, fold),
    }
}

fn split(bits: u64, count: usize, word_order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = (0..count)
        .rev()
        .map(|index| (bits >> (16 * index)) as u16)
        .collect();
    if word_order == WordOrder::LittleEndian {
        words.reverse();
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(data_type: DataType, word_order: WordOrder, scale: f64) -> RegisterDefinition {
        RegisterDefinition {
            key: "value".to_string(),
            name: "Value".to_string(),
            address: 100,
            length: data_type.register_count(),
            data_type,
            word_order,
            scale,
            pvoutput_field: None,
        }
    }

    #[test]
    fn signed_types_use_twos_complement() {
        let int16 = definition(DataType::Int16, WordOrder::BigEndian, 1.0);
        assert_eq!(decode(&int16, &[0xFFFE]).unwrap(), -2.0);

        let int32 = definition(DataType::Int32, WordOrder::BigEndian, 1.0);
        assert_eq!(decode(&int32, &[0xFFFF, 0xFFFF]).unwrap(), -1.0);

        let uint16 = definition(DataType::Uint16, WordOrder::BigEndian, 1.0);
        assert_eq!(decode(&uint16, &[0xFFFE]).unwrap(), 65534.0);
    }

    #[test]
    fn scale_is_applied_after_decoding() {
        let power = definition(DataType::Int16, WordOrder::BigEndian, 0.001);
        let value = decode(&power, &[1500]).unwrap();
        assert!((value - 1.5).abs() < 1e-9);

        let energy = definition(DataType::Uint32, WordOrder::BigEndian, 0.1);
        let value = decode(&energy, &[0x0001, 0x0000]).unwrap();
        assert!((value - 6553.6).abs() < 1e-9);
    }

    #[test]
    fn little_endian_word_order_swaps_words() {
        let big = definition(DataType::Uint32, WordOrder::BigEndian, 1.0);
        let little = definition(DataType::Uint32, WordOrder::LittleEndian, 1.0);
        assert_eq!(decode(&big, &[0x0001, 0x0002]).unwrap(), 65538.0);
        assert_eq!(decode(&little, &[0x0002, 0x0001]).unwrap(), 65538.0);
    }

    #[test]
    fn float32_decodes_ieee_bits() {
        let bits = 230.5f32.to_bits();
        let voltage = definition(DataType::Float32, WordOrder::BigEndian, 1.0);
        let words = [(bits >> 16) as u16, bits as u16];
        assert_eq!(decode(&voltage, &words).unwrap(), 230.5);
    }

    #[test]
    fn wrong_register_count_is_rejected() {
        let energy = definition(DataType::Uint32, WordOrder::BigEndian, 1.0);
        assert_eq!(
            decode(&energy, &[1]),
            Err(DecodeError::WrongLength {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn encode_inverts_decode_for_each_type() {
        let cases = [
            (DataType::Int16, WordOrder::BigEndian, 0.1, -12.3),
            (DataType::Uint16, WordOrder::BigEndian, 0.01, 45.67),
            (DataType::Int32, WordOrder::LittleEndian, 0.001, -70000.125),
            (DataType::Uint32, WordOrder::BigEndian, 0.1, 123456.7),
            (DataType::Float32, WordOrder::LittleEndian, 1.0, 49.75),
            (DataType::Float64, WordOrder::BigEndian, 1.0, 1234.5678),
        ];
        for (data_type, word_order, scale, value) in cases {
            let def = definition(data_type, word_order, scale);
            let words = encode(&def, value).unwrap();
            assert_eq!(words.len(), usize::from(data_type.register_count()));
            let decoded = decode(&def, &words).unwrap();
            assert!(
                (decoded - value).abs() <= scale / 2.0 + 1e-9,
                "{data_type:?}: {decoded} != {value}"
            );
        }
    }

    const SCALES: [f64; 4] = [1.0, 0.1, 0.01, 0.001];
    const ORDERS: [WordOrder; 2] = [WordOrder::BigEndian, WordOrder::LittleEndian];

    /// 固定种子的线性同余序列
    struct Lcg(u64);

    impl Lcg {
        fn next_word(&mut self) -> u16 {
            self.0 = self
                .0
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (self.0 >> 48) as u16
        }
    }

    fn assert_raw_round_trip(def: &RegisterDefinition, words: &[u16]) {
        let Ok(value) = decode(def, words) else {
            // NaN / inf 不产出工程值
            assert!(matches!(def.data_type, DataType::Float32 | DataType::Float64));
            return;
        };
        assert_eq!(
            encode(def, value).unwrap(),
            words,
            "{:?} {:?} scale {}",
            def.data_type,
            def.word_order,
            def.scale
        );
    }

    #[test]
    fn every_16_bit_word_survives_decode_then_encode() {
        for data_type in [DataType::Int16, DataType::Uint16] {
            for scale in SCALES {
                let def = definition(data_type, WordOrder::BigEndian, scale);
                for word in 0..=u16::MAX {
                    assert_raw_round_trip(&def, &[word]);
                }
            }
        }
    }

    #[test]
    fn sampled_32_bit_words_survive_decode_then_encode() {
        let edges: [[u16; 2]; 5] = [
            [0x0000, 0x0000],
            [0xFFFF, 0xFFFF],
            [0x7FFF, 0xFFFF],
            [0x8000, 0x0000],
            [0x0000, 0x0001],
        ];
        let mut rng = Lcg(0x5EED);
        for data_type in [DataType::Int32, DataType::Uint32, DataType::Float32] {
            for word_order in ORDERS {
                for scale in SCALES {
                    let def = definition(data_type, word_order, scale);
                    for words in edges {
                        assert_raw_round_trip(&def, &words);
                    }
                    for _ in 0..20_000 {
                        assert_raw_round_trip(&def, &[rng.next_word(), rng.next_word()]);
                    }
                }
            }
        }
    }

    #[test]
    fn sampled_64_bit_floats_survive_decode_then_encode() {
        let mut rng = Lcg(0xF10A7);
        for word_order in ORDERS {
            let def = definition(DataType::Float64, word_order, 1.0);
            for _ in 0..20_000 {
                let words: Vec<u16> = (0..4).map(|_| rng.next_word()).collect();
                assert_raw_round_trip(&def, &words);
            }
        }
    }

    #[test]
    fn encode_rejects_out_of_range_integers() {
        let def = definition(DataType::Uint16, WordOrder::BigEndian, 1.0);
        assert!(matches!(encode(&def, -1.0), Err(DecodeError::OutOfRange(_))));
        assert!(matches!(encode(&def, 70000.0), Err(DecodeError::OutOfRange(_))));
    }
}
