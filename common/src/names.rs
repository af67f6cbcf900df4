pub const METRIC_SUFFIX: &str = ".metric";

pub const METRIC_TEMPERATURE: &str = "temperature";
pub const METRIC_PRESSURE: &str = "pressure";
pub const METRIC_HUMIDITY: &str = "humidity";

pub const SENSOR1_PREFIX: &str = "sensor1_";
pub const SENSOR2_PREFIX: &str = "sensor2_";
pub const PROBE_PREFIX: &str = "probe_";

pub const ROOM_LIVING: &str = "living_room_";
pub const ROOM_KIDS: &str = "kids_room_";
pub const ROOM_BED: &str = "bed_room_";
pub const ROOM_OUTDOOR: &str = "outdoor_";
