use crate::model::Payload;

/// Splits `payload` into chunks of at most `max` records.
///
/// Records are taken kind by kind (situations, vehicle activities, estimated
/// journeys, production timetables) and keep their order, so a chunk may mix
/// kinds at a kind boundary. An empty payload yields no chunks.
#[must_use]
pub fn split(payload: Payload, max: usize) -> Vec<Payload> {
    let max = max.max(1);
    if payload.element_count() <= max {
        return if payload.is_empty() { Vec::new() } else { vec![payload] };
    }

    let mut chunks = Vec::with_capacity(payload.element_count().div_ceil(max));
    let mut current = Payload::default();
    macro_rules! drain_into_chunks {
        ($field:ident) => {
            for record in payload.$field {
                current.$field.push(record);
                if current.element_count() == max {
                    chunks.push(std::mem::take(&mut current));
                }
            }
        };
    }
    drain_into_chunks!(situations);
    drain_into_chunks!(vehicle_activities);
    drain_into_chunks!(estimated_journeys);
    drain_into_chunks!(production_timetables);
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
