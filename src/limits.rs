/// Maximum practices loaded by one server.
pub const MAX_PRACTICES: usize = 1024;

/// Maximum length of a practice (database) name.
pub const MAX_PRACTICE_NAME_LEN: usize = 128;

/// Maximum length of an appointment's free-text notes, in bytes.
pub const MAX_NOTES_LEN: usize = 8 * 1024;

/// Maximum live reservations in a single scope-day.
pub const MAX_RESERVATIONS_PER_SCOPE_DAY: usize = 512;

/// Maximum appointments held by one practice.
pub const MAX_APPOINTMENTS_PER_PRACTICE: usize = 1_000_000;

/// Maximum registered patients held by one practice.
pub const MAX_PATIENTS_PER_PRACTICE: usize = 1_000_000;
