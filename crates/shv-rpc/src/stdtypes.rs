//! Standard type aliases.
//!
//! Type strings in method descriptions may reference standard types by a
//! `!name` token. The expansions are fixed by the standard and matched
//! textually.

/// Expansion of a standard `!name` type reference, `None` for unknown names.
pub fn standard_type(name: &str) -> Option<&'static str> {
    Some(match name {
        "!dir" => {
            "i{s:name:1,u[b:isGetter:1,b:isSetter,b:largeResult,b:notIndempotent,b:userIDRequired]|n:flags,s|n:paramType,s|n:resultType,i(0,63):accessLevel,{s|n}:signals,{?}:extra:63}|b"
        }
        "!alert" => "i{t:date,i(0,63):level,s:id,?:info}",
        "!clientInfo" => {
            "i{i:clientId:1,s|n:userName,s|n:mountPoint,{i|n}|n:subscriptions,{?}:extra:63}"
        }
        "!stat" => "i{i:type,i:size,i:pageSize,t|n:accessTime,t|n:modTime,i|n:maxWrite}",
        "!exchangeP" => "i{u:counter,u|n:readyToReceive,b|n:data:3}",
        "!exchangeR" => "i{u|n:readyToReceive:1,u|n:readyToSend,b|n:data}",
        "!exchangeV" => "i{u|n:readyToReceive:1,u|n:readyToSend}",
        "!getLogP" => "{t|n:since,t|n:until,i(0,)|n:count,b|n:snapshot,s|n:ri}",
        "!getLogR" => {
            "[i{t:timestamp:1,i(0,)|n:ref,s|n:path,s|n:signal,s|n:source,?:value,s|n:userId,b|n:repeat}]"
        }
        "!historyRecords" => {
            "[i{i[normal:1,keep,timeJump,timeAbig]:type,t:timestamp,s|n:path,s|n:signal,s|n:source,?:value,i:accessLevel,s|n:userId,b|n:repeat,i:timeJump:60}]"
        }
        _ => return None,
    })
}
