// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Built-in filters: identity pass-throughs and the numeric reductions.
//!
//! The integer reductions consume `%d` packets and emit a single `%d`
//! aggregate per round. [`AverageFilter`] is the exception: to stay correct
//! across multiple tree levels it carries `(sum, count)` as `%lf %ud` and
//! accepts either leaf `%d` contributions or partial `%lf %ud` aggregates;
//! the front-end divides at the end.

use anyhow::Result;

use crate::packet::{Packet, Value};

use super::{Filter, FilterContext, FilterOutput};

/// Pass-through for application data.
#[derive(Debug, Default)]
pub struct IdentityFilter;

impl Filter for IdentityFilter {
    fn filter(&mut self, packets: Vec<Packet>, _ctx: &FilterContext) -> Result<FilterOutput> {
        Ok(FilterOutput::forward(packets))
    }
}

/// Pass-through reserved for administrative (control) streams.
#[derive(Debug, Default)]
pub struct NullFilter;

impl Filter for NullFilter {
    fn filter(&mut self, packets: Vec<Packet>, _ctx: &FilterContext) -> Result<FilterOutput> {
        Ok(FilterOutput::forward(packets))
    }
}

/// Extract one `%d` value per input packet.
fn int_inputs(packets: &[Packet]) -> Result<Vec<i32>> {
    packets
        .iter()
        .map(|p| {
            let values = p.unpack("%d")?;
            values
                .first()
                .and_then(Value::as_i32)
                .ok_or_else(|| anyhow::anyhow!("empty %d packet"))
        })
        .collect()
}

/// Emit a single `%d` aggregate, stamped with this node's rank so the next
/// hop buffers it under the right source.
fn int_output(template: &Packet, ctx: &FilterContext, value: i32) -> Result<FilterOutput> {
    let out = Packet::pack(
        template.stream_id(),
        template.tag(),
        ctx.rank,
        "%d",
        &[Value::Int32(value)],
    )?;
    Ok(FilterOutput::one(out))
}

macro_rules! int_reduction {
    ($(#[$doc:meta])* $name:ident, $reduce:expr) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $name;

        impl Filter for $name {
            fn filter(&mut self, packets: Vec<Packet>, ctx: &FilterContext) -> Result<FilterOutput> {
                if packets.is_empty() {
                    return Ok(FilterOutput::default());
                }
                let inputs = int_inputs(&packets)?;
                #[allow(clippy::redundant_closure_call)]
                let value = ($reduce)(&inputs);
                int_output(&packets[0], ctx, value)
            }
        }
    };
}

int_reduction!(
    /// Sum of `%d` inputs, saturating at the `i32` bounds.
    IntSumFilter,
    |inputs: &Vec<i32>| {
        let sum: i64 = inputs.iter().map(|v| i64::from(*v)).sum();
        sum.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }
);
int_reduction!(
    /// Minimum of `%d` inputs.
    IntMinFilter,
    |inputs: &Vec<i32>| inputs.iter().copied().min().expect("non-empty")
);
int_reduction!(
    /// Maximum of `%d` inputs.
    IntMaxFilter,
    |inputs: &Vec<i32>| inputs.iter().copied().max().expect("non-empty")
);

/// Running average carried as `(sum, count)` so intermediate levels stay
/// correct; unpack the result as `%lf %ud` and divide.
#[derive(Debug, Default)]
pub struct AverageFilter;

impl Filter for AverageFilter {
    fn filter(&mut self, packets: Vec<Packet>, ctx: &FilterContext) -> Result<FilterOutput> {
        if packets.is_empty() {
            return Ok(FilterOutput::default());
        }
        let mut sum = 0.0f64;
        let mut count = 0u32;
        for pkt in &packets {
            if pkt.fmt() == "%d" {
                let values = pkt.unpack("%d")?;
                sum += values[0].as_i32().unwrap_or(0) as f64;
                count += 1;
            } else {
                let values = pkt.unpack("%lf %ud")?;
                sum += values[0].as_f64().unwrap_or(0.0);
                count += values[1].as_u32().unwrap_or(0);
            }
        }
        let out = Packet::pack(
            packets[0].stream_id(),
            packets[0].tag(),
            ctx.rank,
            "%lf %ud",
            &[Value::Float64(sum), Value::UInt32(count)],
        )?;
        Ok(FilterOutput::one(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FilterContext {
        FilterContext {
            rank: 1,
            num_children: 2,
            num_descendants: 4,
        }
    }

    fn int_packet(src: u32, v: i32) -> Packet {
        Packet::pack(3, 100, src, "%d", &[Value::Int32(v)]).unwrap()
    }

    #[test]
    fn test_identity_passes_through() {
        let mut f = IdentityFilter;
        let out = f
            .filter(vec![int_packet(4, 1), int_packet(5, 2)], &ctx())
            .unwrap();
        assert_eq!(out.forward.len(), 2);
        assert!(out.reverse.is_empty());
    }

    #[test]
    fn test_sum() {
        let mut f = IntSumFilter;
        let out = f
            .filter(vec![int_packet(4, 1), int_packet(5, 2), int_packet(6, 3)], &ctx())
            .unwrap();
        assert_eq!(out.forward.len(), 1);
        let values = out.forward[0].unpack("%d").unwrap();
        assert_eq!(values[0], Value::Int32(6));
        // Aggregate is re-stamped with the filtering node's rank.
        assert_eq!(out.forward[0].src_rank(), 1);
    }

    #[test]
    fn test_sum_saturates_instead_of_overflowing() {
        let mut f = IntSumFilter;
        let out = f
            .filter(vec![int_packet(4, i32::MAX), int_packet(5, 1)], &ctx())
            .unwrap();
        assert_eq!(out.forward[0].unpack("%d").unwrap()[0], Value::Int32(i32::MAX));

        let out = f
            .filter(vec![int_packet(4, i32::MIN), int_packet(5, -1)], &ctx())
            .unwrap();
        assert_eq!(out.forward[0].unpack("%d").unwrap()[0], Value::Int32(i32::MIN));
    }

    #[test]
    fn test_min_max() {
        let packets = vec![int_packet(4, 5), int_packet(5, -2), int_packet(6, 9)];
        let mut min = IntMinFilter;
        let out = min.filter(packets.clone(), &ctx()).unwrap();
        assert_eq!(out.forward[0].unpack("%d").unwrap()[0], Value::Int32(-2));

        let mut max = IntMaxFilter;
        let out = max.filter(packets, &ctx()).unwrap();
        assert_eq!(out.forward[0].unpack("%d").unwrap()[0], Value::Int32(9));
    }

    #[test]
    fn test_average_mixes_leaf_and_partial_inputs() {
        let mut f = AverageFilter;
        let partial = f
            .filter(vec![int_packet(4, 2), int_packet(5, 4)], &ctx())
            .unwrap();
        let values = partial.forward[0].unpack("%lf %ud").unwrap();
        assert_eq!(values[0], Value::Float64(6.0));
        assert_eq!(values[1], Value::UInt32(2));

        // Second level: combine a partial aggregate with a fresh leaf value.
        let mut g = AverageFilter;
        let out = g
            .filter(vec![partial.forward[0].clone(), int_packet(6, 6)], &ctx())
            .unwrap();
        let values = out.forward[0].unpack("%lf %ud").unwrap();
        assert_eq!(values[0], Value::Float64(12.0));
        assert_eq!(values[1], Value::UInt32(3));
    }

    #[test]
    fn test_empty_round_produces_nothing() {
        let mut f = IntSumFilter;
        let out = f.filter(Vec::new(), &ctx()).unwrap();
        assert!(out.forward.is_empty());
    }

    #[test]
    fn test_format_mismatch_surfaces_as_error() {
        let bad = Packet::pack(3, 100, 4, "%s", &[Value::Str("x".into())]).unwrap();
        let mut f = IntSumFilter;
        assert!(f.filter(vec![bad], &ctx()).is_err());
    }
}
