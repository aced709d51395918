use proptest::prelude::*;
use strata::BitBuffer;

fn mask(width: u32) -> u64 {
    if width == 64 { u64::MAX } else { (1u64 << width) - 1 }
}

fn arb_fields() -> impl Strategy<Value = Vec<(u64, u32)>> {
    prop::collection::vec((any::<u64>(), 1u32..=64), 0..40)
        .prop_map(|fields| {
            fields
                .into_iter()
                .map(|(value, width)| (value & mask(width), width))
                .collect()
        })
}

fn write_all(buffer: &BitBuffer, fields: &[(u64, u32)]) {
    for &(value, width) in fields {
        buffer.write_bits(value, width);
    }
}

proptest! {
    #[test]
    fn test_fields_read_back_in_order(fields in arb_fields()) {
        let buffer = BitBuffer::new();
        write_all(&buffer, &fields);

        let total: usize = fields.iter().map(|&(_, width)| width as usize).sum();
        prop_assert_eq!(buffer.len(), total);
        for &(value, width) in &fields {
            prop_assert_eq!(buffer.read_bits(width), Some(value));
        }
        prop_assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_peek_does_not_move_cursor(fields in arb_fields(), width in 1u32..=64) {
        let buffer = BitBuffer::new();
        write_all(&buffer, &fields);

        let before = buffer.read_position();
        let first = buffer.peek_bits(width);
        prop_assert_eq!(buffer.peek_bits(width), first);
        prop_assert_eq!(buffer.read_position(), before);
        prop_assert_eq!(buffer.read_bits(width), first);
    }

    #[test]
    fn test_short_read_leaves_cursor(fields in arb_fields(), extra in 1usize..64) {
        let buffer = BitBuffer::new();
        write_all(&buffer, &fields);
        let Some(&(_, width)) = fields.first() else {
            return Ok(());
        };
        buffer.read_bits(width);

        let position = buffer.read_position();
        let too_many = buffer.remaining() + extra;
        prop_assert!(buffer.read_bytes(too_many).is_none());
        prop_assert_eq!(buffer.read_position(), position);
    }

    #[test]
    fn test_append_concatenates_unread_bits(
        head in arb_fields(),
        skipped in arb_fields(),
        tail in arb_fields(),
    ) {
        let target = BitBuffer::new();
        write_all(&target, &head);
        let source = BitBuffer::new();
        write_all(&source, &skipped);
        write_all(&source, &tail);
        for &(_, width) in &skipped {
            source.read_bits(width);
        }

        let source_position = source.read_position();
        target.append(&source);
        prop_assert_eq!(source.read_position(), source_position);

        for &(value, width) in head.iter().chain(&tail) {
            prop_assert_eq!(target.read_bits(width), Some(value));
        }
        prop_assert_eq!(target.remaining(), 0);
    }

    #[test]
    fn test_bytes_keep_leading_bits(fields in arb_fields()) {
        let buffer = BitBuffer::new();
        write_all(&buffer, &fields);

        let bytes = buffer.to_bytes();
        prop_assert_eq!(bytes.len(), buffer.len().div_ceil(8));
        let decoded = BitBuffer::from_bytes(&bytes);
        for &(value, width) in &fields {
            prop_assert_eq!(decoded.read_bits(width), Some(value));
        }
        prop_assert!(decoded.remaining() < 8);
    }

    #[test]
    fn test_strings_and_floats(text in ".{0,64}", number in any::<f64>(), flag in any::<bool>()) {
        let buffer = BitBuffer::new();
        buffer.write(&flag);
        buffer.write(&text);
        buffer.write(&number);

        prop_assert_eq!(buffer.read::<bool>(), Some(flag));
        prop_assert_eq!(buffer.read::<String>(), Some(text));
        prop_assert_eq!(buffer.read::<f64>().map(f64::to_bits), Some(number.to_bits()));
    }
}
