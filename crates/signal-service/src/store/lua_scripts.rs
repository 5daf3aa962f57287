//! Lua scripts for Redis signal storage.
//!
//! Append and expiry each run as one script so sequence assignment, the
//! mailbox write and the index update cannot interleave with each other.

/// Assign the next sequence number and store the record under it.
///
/// Arguments:
/// - KEYS[1]: Mailbox key
/// - KEYS[2]: Mailbox index set (`signals:mailboxes`)
/// - KEYS[3]: Sequence counter (`signals:seq`)
/// - ARGV[1]: `createdAt` in epoch ms (the score)
/// - ARGV[2]: JSON-encoded record
///
/// Returns the assigned sequence number.
pub const APPEND_SIGNAL: &str = r"
local seq = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[1], ARGV[1], string.format('%020d', seq) .. ':' .. ARGV[2])
redis.call('SADD', KEYS[2], KEYS[1])
return seq
";

/// Trim every indexed mailbox and unindex the ones left empty.
///
/// Arguments:
/// - KEYS[1]: Mailbox index set (`signals:mailboxes`)
/// - ARGV[1]: Cutoff in epoch ms; members with score < cutoff are removed
///
/// Returns the number of removed records.
pub const EXPIRE_MAILBOXES: &str = r"
local removed = 0
local mailboxes = redis.call('SMEMBERS', KEYS[1])

for _, mailbox in ipairs(mailboxes) do
    removed = removed + redis.call('ZREMRANGEBYSCORE', mailbox, '-inf', '(' .. ARGV[1])
    if redis.call('ZCARD', mailbox) == 0 then
        redis.call('SREM', KEYS[1], mailbox)
    end
end

return removed
";
